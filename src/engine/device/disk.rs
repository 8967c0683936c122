// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Disk volumes: one file per volume in an archive directory, holding
// fixed size physical blocks back to back. There are no file marks; every
// position is in file 0.

use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use crate::{
    engine::{
        block::Block,
        device::{
            cancel::CancelToken,
            invalid_state,
            writing::{read_at, write_at},
            Capabilities, Device, DeviceKind, DeviceState, ReadOutcome, WriteOutcome,
        },
        types::{AccessMode, DevicePosition, VolumeName, BLOCK_HEADER_SIZE},
    },
    stord::{ErrorEnum, StordError, StordResult},
};

#[derive(Debug)]
pub struct DiskFile {
    name: String,
    directory: PathBuf,
    physical_size: u64,
    capacity: Option<u64>,
    file: Option<File>,
    volume: Option<VolumeName>,
    mode: AccessMode,
    state: DeviceState,
    pos: DevicePosition,
}

impl DiskFile {
    pub fn new(
        name: &str,
        directory: &Path,
        block_size: usize,
        capacity: Option<u64>,
    ) -> StordResult<DiskFile> {
        fs::create_dir_all(directory)?;
        Ok(DiskFile {
            name: name.to_owned(),
            directory: directory.to_owned(),
            physical_size: (BLOCK_HEADER_SIZE + block_size) as u64,
            capacity,
            file: None,
            volume: None,
            mode: AccessMode::Read,
            state: DeviceState::Closed,
            pos: DevicePosition::default(),
        })
    }

    pub fn volume_path(&self, volume: &VolumeName) -> PathBuf {
        self.directory.join(&**volume)
    }

    fn offset(&self) -> u64 {
        u64::from(self.pos.block) * self.physical_size
    }

    fn file(&mut self, op: &str) -> StordResult<&mut File> {
        let state = self.state;
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(invalid_state(&self.name, state, op)),
        }
    }

    fn require_write(&self, op: &str) -> StordResult<()> {
        if self.mode == AccessMode::Write {
            Ok(())
        } else {
            Err(invalid_state(&self.name, self.state, op))
        }
    }
}

impl Device for DiskFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::DiskFile
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            concurrent_read: true,
            file_marks: false,
            changer: true,
        }
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn tell(&self) -> DevicePosition {
        self.pos
    }

    fn volume(&self) -> Option<&VolumeName> {
        self.volume.as_ref()
    }

    fn open(&mut self, volume: &VolumeName, mode: AccessMode) -> StordResult<()> {
        self.state = DeviceState::Opening;
        self.file = None;
        let path = self.volume_path(volume);
        let result = match mode {
            AccessMode::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path),
            AccessMode::Read => OpenOptions::new().read(true).open(&path),
        };
        let file = match result {
            Ok(file) => file,
            Err(err) => {
                self.state = DeviceState::Closed;
                self.volume = None;
                return Err(if err.kind() == io::ErrorKind::NotFound {
                    StordError::Engine(
                        ErrorEnum::NoSuchVolume,
                        format!("no volume file {}", path.display()),
                    )
                } else {
                    StordError::from(err)
                });
            }
        };
        debug!("disk \"{}\": opened {} for {}", self.name, path.display(), mode);
        self.file = Some(file);
        self.volume = Some(volume.clone());
        self.mode = mode;
        self.pos = DevicePosition::default();
        self.state = DeviceState::AtBot;
        Ok(())
    }

    fn write_block(&mut self, block: &Block, cancel: &CancelToken) -> StordResult<WriteOutcome> {
        self.require_write("write")?;
        cancel.check()?;

        let bytes = block.as_bytes();
        if !block.is_label() {
            if self.state == DeviceState::AtEot {
                return Ok(WriteOutcome::EndOfMedium);
            }
            if let Some(capacity) = self.capacity {
                if self.offset() + bytes.len() as u64 > capacity {
                    info!("disk \"{}\": volume full at {}", self.name, self.pos);
                    self.state = DeviceState::AtEot;
                    return Ok(WriteOutcome::EndOfMedium);
                }
            }
        }

        let offset = self.offset();
        write_at(self.file("write")?, offset, &[bytes])?;
        self.pos = self.pos.next_block()?;
        if self.state != DeviceState::AtEot {
            self.state = DeviceState::Active;
        }
        cancel.check()?;
        Ok(WriteOutcome::Written)
    }

    fn read_block(
        &mut self,
        block: &mut Block,
        cancel: &CancelToken,
    ) -> StordResult<ReadOutcome> {
        cancel.check()?;
        let offset = self.offset();
        let size = self.physical_size as usize;
        if size > block.physical_size() {
            return Err(StordError::Engine(
                ErrorEnum::Invalid,
                format!(
                    "buffer of {} bytes cannot hold blocks of {} bytes",
                    block.physical_size(),
                    size
                ),
            ));
        }
        let n = read_at(self.file("read")?, offset, &mut block.raw_mut()[..size])?;
        if n == 0 {
            self.state = DeviceState::AtEod;
            return Ok(ReadOutcome::EndOfMedium);
        }
        self.pos = self.pos.next_block()?;
        self.state = DeviceState::Active;
        if n < size {
            return Err(StordError::Engine(
                ErrorEnum::CorruptBlock,
                format!("partial block of {n} bytes at end of volume"),
            ));
        }
        cancel.check()?;
        block.decode(size)?;
        Ok(ReadOutcome::Block)
    }

    fn position(&mut self, file: u32, block: u32, cancel: &CancelToken) -> StordResult<()> {
        cancel.check()?;
        if file != 0 {
            return Err(StordError::Engine(
                ErrorEnum::Invalid,
                format!("disk volumes have no file {file}"),
            ));
        }
        let len = self.file("position")?.metadata()?.len();
        if u64::from(block) * self.physical_size > len {
            return Err(StordError::Engine(
                ErrorEnum::Invalid,
                format!("disk \"{}\" has no block {}", self.name, block),
            ));
        }
        self.pos = DevicePosition::new(0, block);
        self.state = if block == 0 {
            DeviceState::AtBot
        } else {
            DeviceState::Active
        };
        Ok(())
    }

    fn eod(&mut self, cancel: &CancelToken) -> StordResult<u32> {
        cancel.check()?;
        let len = self.file("find end of data")?.metadata()?.len();
        if len % self.physical_size != 0 {
            warn!(
                "disk \"{}\": {} trailing bytes after the last whole block ignored",
                self.name,
                len % self.physical_size
            );
        }
        let blocks = u32::try_from(len / self.physical_size).map_err(|_| {
            StordError::Engine(ErrorEnum::Invalid, "block count overflow".into())
        })?;
        self.pos = DevicePosition::new(0, blocks);
        self.state = DeviceState::AtEod;
        Ok(blocks)
    }

    /// Truncate the volume at the current position.
    fn weof(&mut self) -> StordResult<()> {
        self.require_write("truncate")?;
        let offset = self.offset();
        let file = self.file("truncate")?;
        file.set_len(offset)?;
        file.sync_all()?;
        if self.state != DeviceState::AtEot {
            self.state = DeviceState::AtEof;
        }
        Ok(())
    }

    fn rewind(&mut self) -> StordResult<()> {
        if self.file.is_some() {
            self.pos = DevicePosition::default();
            self.state = DeviceState::AtBot;
        }
        Ok(())
    }

    fn unload(&mut self) -> StordResult<()> {
        if let Some(file) = self.file.take() {
            if self.mode == AccessMode::Write {
                file.sync_all()?;
            }
        }
        self.volume = None;
        self.pos = DevicePosition::default();
        self.state = DeviceState::Closed;
        Ok(())
    }

    /// Every volume file in the archive directory.
    fn volumes(&self) -> Vec<VolumeName> {
        let mut volumes: Vec<VolumeName> = match fs::read_dir(&self.directory) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter_map(|name| VolumeName::new(&name).ok())
                .collect(),
            Err(err) => {
                warn!("disk \"{}\": cannot list volumes: {}", self.name, err);
                vec![]
            }
        };
        volumes.sort();
        volumes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_block(number: u32) -> Block {
        let mut block = Block::new(64);
        block.set_number(number);
        block.put_record(2, 1, &[number as u8; 20]);
        block.seal();
        block
    }

    #[test]
    fn test_missing_volume() {
        let dir = tempfile::tempdir().unwrap();
        let mut disk = DiskFile::new("disk0", dir.path(), 64, None).unwrap();
        assert_matches!(
            disk.open(&VolumeName::new("Vol-0009").unwrap(), AccessMode::Read),
            Err(StordError::Engine(ErrorEnum::NoSuchVolume, _))
        );
        assert_eq!(disk.state(), DeviceState::Closed);
    }

    #[test]
    fn test_append_and_read() {
        let cancel = CancelToken::new();
        let dir = tempfile::tempdir().unwrap();
        let vol = VolumeName::new("Vol-0001").unwrap();
        let mut disk = DiskFile::new("disk0", dir.path(), 64, None).unwrap();

        disk.open(&vol, AccessMode::Write).unwrap();
        let mut block = Block::new(64);
        assert_eq!(
            disk.read_block(&mut block, &cancel).unwrap(),
            ReadOutcome::EndOfMedium
        );
        for n in 1..=3 {
            disk.write_block(&data_block(n), &cancel).unwrap();
        }
        disk.weof().unwrap();
        disk.unload().unwrap();

        disk.open(&vol, AccessMode::Write).unwrap();
        assert_eq!(disk.eod(&cancel).unwrap(), 3);
        disk.write_block(&data_block(4), &cancel).unwrap();
        disk.unload().unwrap();

        disk.open(&vol, AccessMode::Read).unwrap();
        disk.position(0, 2, &cancel).unwrap();
        disk.read_block(&mut block, &cancel).unwrap();
        assert_eq!(block.number(), 3);
        disk.read_block(&mut block, &cancel).unwrap();
        assert_eq!(block.number(), 4);
        assert_eq!(
            disk.read_block(&mut block, &cancel).unwrap(),
            ReadOutcome::EndOfMedium
        );
        assert!(disk.position(1, 0, &cancel).is_err());
        assert_eq!(disk.volumes(), vec![vol]);
    }

    #[test]
    fn test_weof_truncates() {
        let cancel = CancelToken::new();
        let dir = tempfile::tempdir().unwrap();
        let vol = VolumeName::new("Vol-0001").unwrap();
        let mut disk = DiskFile::new("disk0", dir.path(), 64, None).unwrap();
        disk.open(&vol, AccessMode::Write).unwrap();
        for n in 1..=5 {
            disk.write_block(&data_block(n), &cancel).unwrap();
        }
        disk.position(0, 2, &cancel).unwrap();
        disk.weof().unwrap();
        assert_eq!(disk.eod(&cancel).unwrap(), 2);
    }

    #[test]
    fn test_capacity() {
        let cancel = CancelToken::new();
        let dir = tempfile::tempdir().unwrap();
        let mut disk = DiskFile::new("disk0", dir.path(), 64, Some(80 * 2)).unwrap();
        disk.open(&VolumeName::new("Vol-0001").unwrap(), AccessMode::Write)
            .unwrap();
        assert_eq!(
            disk.write_block(&data_block(1), &cancel).unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            disk.write_block(&data_block(2), &cancel).unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            disk.write_block(&data_block(3), &cancel).unwrap(),
            WriteOutcome::EndOfMedium
        );
        assert_eq!(disk.tell(), DevicePosition::new(0, 2));
    }
}
