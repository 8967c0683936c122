// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::fmt;

use crate::{
    engine::{
        block::header::{checksum, BlockHeader, BLOCK_FLAG_CONTINUED, BLOCK_FLAG_LABEL},
        record::header::RecordHeader,
        types::{BLOCK_HEADER_SIZE, MAX_BLOCK_SIZE, RECORD_HEADER_SIZE},
    },
    stord::{ErrorEnum, StordError, StordResult},
};

/// Result of appending a record, or the tail of one, to a block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PutOutcome {
    /// All of the data went into the block.
    Written,
    /// The block filled up; this many bytes of the data did not fit.
    PartiallyWritten(usize),
    /// Not even a fragment header fits; nothing was written.
    Full,
}

/// One fragment read out of a block. `data` borrows from the block.
#[derive(Debug, Eq, PartialEq)]
pub struct Fragment<'a> {
    pub stream: i32,
    pub file_index: i32,
    pub continuation: bool,
    /// Bytes of the logical record still to come, counting `data`.
    pub remaining: u32,
    pub data: &'a [u8],
}

impl Fragment<'_> {
    /// True if this fragment completes its record.
    pub fn is_last(&self) -> bool {
        self.data.len() as u64 == u64::from(self.remaining)
    }
}

/// A fixed capacity I/O buffer for one physical block.
///
/// The buffer is allocated once, at its full physical size, and reused for
/// every block written or read. Offsets into the payload are plain indices;
/// `used` is the end of the packed fragments and `cursor` the read position.
pub struct Block {
    buf: Vec<u8>,
    block_size: usize,
    used: usize,
    cursor: usize,
    number: u32,
    flags: u32,
    sealed: Option<u32>,
    first_index: i32,
    last_index: i32,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("block_size", &self.block_size)
            .field("number", &self.number)
            .field("used", &self.used)
            .field("flags", &self.flags)
            .field("sealed", &self.sealed)
            .finish()
    }
}

impl Block {
    /// Allocate a block with `block_size` bytes of payload capacity.
    pub fn new(block_size: usize) -> Block {
        assert!(block_size > RECORD_HEADER_SIZE && block_size <= MAX_BLOCK_SIZE);
        Block {
            buf: vec![0; BLOCK_HEADER_SIZE + block_size],
            block_size,
            used: 0,
            cursor: 0,
            number: 0,
            flags: 0,
            sealed: None,
            first_index: 0,
            last_index: 0,
        }
    }

    /// Size of the block on the medium, header included.
    pub fn physical_size(&self) -> usize {
        self.buf.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.block_size - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.is_some()
    }

    pub fn is_label(&self) -> bool {
        self.flags & BLOCK_FLAG_LABEL != 0
    }

    /// True if the block begins with the tail of a record started earlier.
    pub fn is_continued(&self) -> bool {
        self.flags & BLOCK_FLAG_CONTINUED != 0
    }

    /// First and last positive file index with a fragment in this block.
    pub fn file_indexes(&self) -> Option<(i32, i32)> {
        if self.first_index > 0 {
            Some((self.first_index, self.last_index))
        } else {
            None
        }
    }

    /// Clear the block for reuse. Capacity is kept.
    pub fn reset(&mut self) {
        let end = BLOCK_HEADER_SIZE + self.used;
        self.buf[..end].iter_mut().for_each(|b| *b = 0);
        self.used = 0;
        self.cursor = 0;
        self.number = 0;
        self.flags = 0;
        self.sealed = None;
        self.first_index = 0;
        self.last_index = 0;
    }

    /// Mark an empty block as a label block.
    pub fn set_label(&mut self) {
        assert!(self.sealed.is_none(), "label flag set on a sealed block");
        assert!(self.is_empty(), "label flag set on a block holding data");
        self.flags |= BLOCK_FLAG_LABEL;
    }

    pub fn set_number(&mut self, number: u32) {
        assert!(self.sealed.is_none(), "block number set on a sealed block");
        self.number = number;
    }

    /// Append a complete record.
    pub fn put_record(&mut self, stream: i32, file_index: i32, data: &[u8]) -> PutOutcome {
        self.put_fragment(stream, file_index, data, false)
    }

    /// Append as much of `data` as fits behind a fragment header.
    /// `data` is everything that is left of the record, so its length is
    /// what the header records as the remaining length.
    pub fn put_fragment(
        &mut self,
        stream: i32,
        file_index: i32,
        data: &[u8],
        continuation: bool,
    ) -> PutOutcome {
        assert!(self.sealed.is_none(), "put_record on a sealed block");
        assert_eq!(
            file_index < 0,
            self.is_label(),
            "label and data records may not share a block"
        );
        let data_length = u32::try_from(data.len()).expect("record length checked by caller");

        let free = self.free();
        if free < RECORD_HEADER_SIZE || (free == RECORD_HEADER_SIZE && !data.is_empty()) {
            return PutOutcome::Full;
        }

        let offset = BLOCK_HEADER_SIZE + self.used;
        RecordHeader {
            stream,
            file_index,
            continuation,
            data_length,
        }
        .to_buf(&mut self.buf[offset..offset + RECORD_HEADER_SIZE]);

        let len = data.len().min(free - RECORD_HEADER_SIZE);
        let start = offset + RECORD_HEADER_SIZE;
        self.buf[start..start + len].copy_from_slice(&data[..len]);

        if continuation && self.used == 0 {
            self.flags |= BLOCK_FLAG_CONTINUED;
        }
        self.used += RECORD_HEADER_SIZE + len;

        if file_index > 0 {
            if self.first_index == 0 {
                self.first_index = file_index;
            }
            self.last_index = file_index;
        }

        if len == data.len() {
            PutOutcome::Written
        } else {
            PutOutcome::PartiallyWritten(data.len() - len)
        }
    }

    /// Finish the block: write the header and compute the checksum.
    /// The block is read-only until `reset()`. Sealing twice returns the
    /// same checksum and changes nothing.
    pub fn seal(&mut self) -> u32 {
        if let Some(sum) = self.sealed {
            return sum;
        }
        self.stamp()
    }

    /// Give a sealed block a new number, as when it is moved to another
    /// volume or out of the spool.
    pub fn restamp(&mut self, number: u32) -> u32 {
        assert!(self.sealed.is_some(), "restamp of an unsealed block");
        self.number = number;
        self.stamp()
    }

    fn stamp(&mut self) -> u32 {
        let payload_end = BLOCK_HEADER_SIZE + self.used;
        self.buf[payload_end..].iter_mut().for_each(|b| *b = 0);

        let mut header = BlockHeader {
            number: self.number,
            checksum: 0,
            length: self.used as u32,
            flags: self.flags,
        };
        header.to_buf(&mut self.buf[..BLOCK_HEADER_SIZE]);
        header.checksum = checksum(
            &self.buf[..BLOCK_HEADER_SIZE],
            &self.buf[BLOCK_HEADER_SIZE..payload_end],
        );
        header.to_buf(&mut self.buf[..BLOCK_HEADER_SIZE]);

        self.cursor = 0;
        self.sealed = Some(header.checksum);
        header.checksum
    }

    /// The sealed block as it goes onto the medium.
    pub fn as_bytes(&self) -> &[u8] {
        assert!(self.sealed.is_some(), "unsealed block handed to a device");
        &self.buf
    }

    /// The whole physical buffer, for a device to read into. The previous
    /// contents are forgotten; call `decode()` once the buffer is filled.
    pub fn raw_mut(&mut self) -> &mut [u8] {
        self.used = 0;
        self.cursor = 0;
        self.number = 0;
        self.flags = 0;
        self.sealed = None;
        self.first_index = 0;
        self.last_index = 0;
        &mut self.buf
    }

    /// Copy a physical block into this buffer and validate it.
    pub fn load(&mut self, bytes: &[u8]) -> StordResult<()> {
        if bytes.len() > self.physical_size() {
            return Err(StordError::Engine(
                ErrorEnum::CorruptBlock,
                format!(
                    "block of {} bytes does not fit a buffer of {} bytes",
                    bytes.len(),
                    self.physical_size()
                ),
            ));
        }
        let len = bytes.len();
        self.raw_mut()[..len].copy_from_slice(bytes);
        self.decode(len)
    }

    /// Validate the `len` bytes a device placed in the buffer. On success
    /// the block is sealed and ready for `read_record()`.
    pub fn decode(&mut self, len: usize) -> StordResult<()> {
        if len < BLOCK_HEADER_SIZE {
            return Err(StordError::Engine(
                ErrorEnum::CorruptBlock,
                format!("short block of {len} bytes"),
            ));
        }
        let header = BlockHeader::from_buf(&self.buf[..BLOCK_HEADER_SIZE])?;
        let length = header.length as usize;
        if length > self.block_size || BLOCK_HEADER_SIZE + length > len {
            return Err(StordError::Engine(
                ErrorEnum::CorruptBlock,
                format!(
                    "block {} claims {} payload bytes, {} available",
                    header.number,
                    length,
                    len - BLOCK_HEADER_SIZE
                ),
            ));
        }

        let computed = checksum(
            &self.buf[..BLOCK_HEADER_SIZE],
            &self.buf[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + length],
        );
        if computed != header.checksum {
            return Err(StordError::Engine(
                ErrorEnum::CorruptBlock,
                format!(
                    "block {} checksum mismatch: calculated {:#010x}, stored {:#010x}",
                    header.number, computed, header.checksum
                ),
            ));
        }

        self.used = length;
        self.cursor = 0;
        self.number = header.number;
        self.flags = header.flags;
        self.sealed = Some(header.checksum);
        Ok(())
    }

    /// Extract the next fragment, or `None` at the end of the block.
    pub fn read_record(&mut self) -> StordResult<Option<Fragment<'_>>> {
        assert!(self.sealed.is_some(), "read_record on an unsealed block");

        if self.used - self.cursor < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        let offset = BLOCK_HEADER_SIZE + self.cursor;
        let header = RecordHeader::from_buf(&self.buf[offset..offset + RECORD_HEADER_SIZE])?;

        let available = self.used - self.cursor - RECORD_HEADER_SIZE;
        let len = (header.data_length as usize).min(available);
        let start = offset + RECORD_HEADER_SIZE;
        self.cursor += RECORD_HEADER_SIZE + len;

        Ok(Some(Fragment {
            stream: header.stream,
            file_index: header.file_index,
            continuation: header.continuation,
            remaining: header.data_length,
            data: &self.buf[start..start + len],
        }))
    }
}
