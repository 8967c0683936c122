// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Functions to unify writing to volume images

use std::{
    fs::File,
    io::{self, BufWriter, Cursor, Read, Seek, SeekFrom, Write},
};

/// The SyncAll trait unifies the File type with other types that do
/// not implement sync_all().
pub trait SyncAll: Write {
    fn sync_all(&mut self) -> io::Result<()>;
}

impl SyncAll for File {
    /// Invokes File::sync_all() thereby syncing all the data
    fn sync_all(&mut self) -> io::Result<()> {
        File::sync_all(self)
    }
}

impl<T> SyncAll for Cursor<T>
where
    Cursor<T>: Write,
{
    /// A no-op. The data is already in the Cursor's inner value.
    fn sync_all(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T> SyncAll for BufWriter<T>
where
    T: SyncAll,
{
    fn sync_all(&mut self) -> io::Result<()> {
        self.flush()?;
        self.get_mut().sync_all()
    }
}

/// Read up to `buf.len()` bytes at `offset`, stopping short only at the
/// end of the image. Return the number of bytes read.
pub fn read_at<F>(f: &mut F, offset: u64, buf: &mut [u8]) -> io::Result<usize>
where
    F: Read + Seek,
{
    f.seek(SeekFrom::Start(offset))?;
    let mut done = 0;
    while done < buf.len() {
        match f.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => return Err(err),
        }
    }
    Ok(done)
}

/// Write all of `bufs`, in order, starting at `offset`.
pub fn write_at<F>(f: &mut F, offset: u64, bufs: &[&[u8]]) -> io::Result<()>
where
    F: Write + Seek,
{
    f.seek(SeekFrom::Start(offset))?;
    for buf in bufs {
        f.write_all(buf)?;
    }
    f.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_read_at_end() {
        let mut image = Cursor::new(vec![1u8, 2, 3, 4, 5]);
        let mut buf = [0u8; 4];
        assert_eq!(read_at(&mut image, 3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);

        write_at(&mut image, 5, &[&[6, 7], &[8]]).unwrap();
        assert_eq!(image.get_ref(), &vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
