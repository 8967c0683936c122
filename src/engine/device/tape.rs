// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Tape semantics over a seekable image. The image is a sequence of
// entries, each a little endian u32 length followed by that many bytes.
// A zero length entry is a file mark. A length of 0xffff_ffff, or the end
// of the image, is the end of recorded data. Every write rewrites the end
// of data marker behind it, so writing in the middle of a tape discards
// whatever followed.

use std::{
    fmt::Debug,
    fs::{File, OpenOptions},
    io::{Read, Seek, Write},
    path::Path,
};

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    engine::{
        block::Block,
        device::{
            cancel::CancelToken,
            invalid_state,
            writing::{read_at, write_at, SyncAll},
            Capabilities, Device, DeviceKind, DeviceState, ReadOutcome, WriteOutcome,
        },
        types::{AccessMode, DevicePosition, VolumeName, BLOCK_HEADER_SIZE},
    },
    stord::{ErrorEnum, StordError, StordResult},
};

const FILE_MARK: u32 = 0;
const END_OF_DATA: u32 = u32::MAX;
const ENTRY_HEADER_SIZE: u64 = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Entry {
    Block(u32),
    Mark,
    EndOfData,
}

#[derive(Debug)]
pub struct SequentialTape<F> {
    name: String,
    image: F,
    physical_size: usize,
    capacity: Option<u64>,
    volume: Option<VolumeName>,
    mode: AccessMode,
    state: DeviceState,
    offset: u64,
    pos: DevicePosition,
}

impl SequentialTape<File> {
    /// A tape drive backed by an image file, created empty if missing.
    pub fn open_file(
        name: &str,
        path: &Path,
        block_size: usize,
        capacity: Option<u64>,
    ) -> StordResult<SequentialTape<File>> {
        let image = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| {
                StordError::Chained(
                    format!("failed to open tape image {}", path.display()),
                    Box::new(StordError::from(err)),
                )
            })?;
        Ok(SequentialTape::new(name, image, block_size, capacity))
    }
}

impl<F> SequentialTape<F>
where
    F: Read + Write + Seek + SyncAll + Send + Debug,
{
    pub fn new(name: &str, image: F, block_size: usize, capacity: Option<u64>) -> SequentialTape<F> {
        SequentialTape {
            name: name.to_owned(),
            image,
            physical_size: BLOCK_HEADER_SIZE + block_size,
            capacity,
            volume: None,
            mode: AccessMode::Read,
            state: DeviceState::Closed,
            offset: 0,
            pos: DevicePosition::default(),
        }
    }

    pub fn image(&self) -> &F {
        &self.image
    }

    pub fn into_image(self) -> F {
        self.image
    }

    fn require_open(&self, op: &str) -> StordResult<()> {
        match self.state {
            DeviceState::Closed | DeviceState::Opening => {
                Err(invalid_state(&self.name, self.state, op))
            }
            _ => Ok(()),
        }
    }

    fn entry_at(&mut self, offset: u64) -> StordResult<Entry> {
        let mut buf = [0u8; ENTRY_HEADER_SIZE as usize];
        if read_at(&mut self.image, offset, &mut buf)? < buf.len() {
            return Ok(Entry::EndOfData);
        }
        Ok(match LittleEndian::read_u32(&buf) {
            FILE_MARK => Entry::Mark,
            END_OF_DATA => Entry::EndOfData,
            len => Entry::Block(len),
        })
    }

    /// Step over the entry at the current offset without reading its
    /// contents.
    fn skip_entry(&mut self) -> StordResult<Entry> {
        let entry = self.entry_at(self.offset)?;
        match entry {
            Entry::Block(len) => {
                self.offset += ENTRY_HEADER_SIZE + u64::from(len);
                self.pos = self.pos.next_block()?;
            }
            Entry::Mark => {
                self.offset += ENTRY_HEADER_SIZE;
                self.pos = self.pos.next_file()?;
            }
            Entry::EndOfData => (),
        }
        Ok(entry)
    }

    fn write_entry(&mut self, bytes: &[u8]) -> StordResult<()> {
        let len = u32::try_from(bytes.len()).map_err(|_| {
            StordError::Engine(ErrorEnum::Invalid, "tape entry too large".into())
        })?;
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, len);
        let mut eod_buf = [0u8; 4];
        LittleEndian::write_u32(&mut eod_buf, END_OF_DATA);
        write_at(&mut self.image, self.offset, &[&len_buf, bytes, &eod_buf])?;
        self.offset += ENTRY_HEADER_SIZE + u64::from(len);
        Ok(())
    }

    fn seek_start(&mut self) {
        self.offset = 0;
        self.pos = DevicePosition::default();
    }
}

impl<F> Device for SequentialTape<F>
where
    F: Read + Write + Seek + SyncAll + Send + Debug,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::SequentialTape
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            concurrent_read: false,
            file_marks: true,
            changer: false,
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
        debug!("tape \"{}\": opening volume \"{}\" for {}", self.name, volume, mode);
        self.state = DeviceState::Opening;
        self.seek_start();
        self.volume = Some(volume.clone());
        self.mode = mode;
        self.state = DeviceState::AtBot;
        Ok(())
    }

    fn write_block(&mut self, block: &Block, cancel: &CancelToken) -> StordResult<WriteOutcome> {
        self.require_open("write")?;
        if self.mode != AccessMode::Write {
            return Err(invalid_state(&self.name, self.state, "write in read mode"));
        }
        cancel.check()?;

        let bytes = block.as_bytes();
        if !block.is_label() {
            if self.state == DeviceState::AtEot {
                return Ok(WriteOutcome::EndOfMedium);
            }
            if let Some(capacity) = self.capacity {
                if self.offset + ENTRY_HEADER_SIZE + bytes.len() as u64 > capacity {
                    info!(
                        "tape \"{}\": end of medium at {} after {} bytes",
                        self.name, self.pos, self.offset
                    );
                    self.state = DeviceState::AtEot;
                    return Ok(WriteOutcome::EndOfMedium);
                }
            }
        }

        self.write_entry(bytes)?;
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
        self.require_open("read")?;
        cancel.check()?;

        match self.entry_at(self.offset)? {
            Entry::EndOfData => {
                self.state = DeviceState::AtEod;
                Ok(ReadOutcome::EndOfMedium)
            }
            Entry::Mark => {
                self.offset += ENTRY_HEADER_SIZE;
                self.pos = self.pos.next_file()?;
                self.state = DeviceState::AtEof;
                Ok(ReadOutcome::EndOfFile)
            }
            Entry::Block(len) => {
                let start = self.offset + ENTRY_HEADER_SIZE;
                self.offset = start + u64::from(len);
                self.pos = self.pos.next_block()?;
                self.state = DeviceState::Active;

                let len = len as usize;
                if len > self.physical_size {
                    return Err(StordError::Engine(
                        ErrorEnum::CorruptBlock,
                        format!(
                            "tape entry of {} bytes exceeds the block size of {}",
                            len, self.physical_size
                        ),
                    ));
                }
                let n = read_at(&mut self.image, start, &mut block.raw_mut()[..len])?;
                if n < len {
                    return Err(StordError::Engine(
                        ErrorEnum::CorruptBlock,
                        format!("tape entry truncated: {n} of {len} bytes"),
                    ));
                }
                cancel.check()?;
                block.decode(len)?;
                Ok(ReadOutcome::Block)
            }
        }
    }

    fn position(&mut self, file: u32, block: u32, cancel: &CancelToken) -> StordResult<()> {
        self.require_open("position")?;
        self.seek_start();
        while self.pos.file < file {
            cancel.check()?;
            if self.skip_entry()? == Entry::EndOfData {
                return Err(StordError::Engine(
                    ErrorEnum::Invalid,
                    format!("tape \"{}\" has no file {}", self.name, file),
                ));
            }
        }
        while self.pos.block < block {
            cancel.check()?;
            match self.entry_at(self.offset)? {
                Entry::Block(_) => {
                    self.skip_entry()?;
                }
                Entry::Mark | Entry::EndOfData => {
                    return Err(StordError::Engine(
                        ErrorEnum::Invalid,
                        format!("tape \"{}\" file {} has no block {}", self.name, file, block),
                    ));
                }
            }
        }
        self.state = if self.offset == 0 {
            DeviceState::AtBot
        } else {
            DeviceState::Active
        };
        Ok(())
    }

    fn eod(&mut self, cancel: &CancelToken) -> StordResult<u32> {
        self.require_open("find end of data")?;
        self.seek_start();
        let mut blocks = 0u32;
        loop {
            cancel.check()?;
            match self.skip_entry()? {
                Entry::Block(_) => {
                    blocks = blocks.checked_add(1).ok_or_else(|| {
                        StordError::Engine(ErrorEnum::Invalid, "block count overflow".into())
                    })?
                }
                Entry::Mark => (),
                Entry::EndOfData => break,
            }
        }
        self.state = DeviceState::AtEod;
        debug!(
            "tape \"{}\": end of data at {} with {} blocks",
            self.name, self.pos, blocks
        );
        Ok(blocks)
    }

    fn weof(&mut self) -> StordResult<()> {
        self.require_open("write a file mark")?;
        if self.mode != AccessMode::Write {
            return Err(invalid_state(&self.name, self.state, "write a file mark in read mode"));
        }
        self.write_entry(&[])?;
        self.image.sync_all()?;
        self.pos = self.pos.next_file()?;
        if self.state != DeviceState::AtEot {
            self.state = DeviceState::AtEof;
        }
        Ok(())
    }

    fn rewind(&mut self) -> StordResult<()> {
        if self.state == DeviceState::Closed {
            return Ok(());
        }
        self.seek_start();
        self.state = DeviceState::AtBot;
        Ok(())
    }

    fn unload(&mut self) -> StordResult<()> {
        if self.state != DeviceState::Closed {
            self.image.sync_all()?;
            debug!("tape \"{}\": unloaded", self.name);
        }
        self.seek_start();
        self.volume = None;
        self.state = DeviceState::Closed;
        Ok(())
    }
}
