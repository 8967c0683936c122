// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISCSI};

use crate::{
    engine::types::BLOCK_HEADER_SIZE,
    stord::{ErrorEnum, StordError, StordResult},
};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The block holds label records only.
pub const BLOCK_FLAG_LABEL: u32 = 1;
/// The first fragment in the block continues a record from an earlier block.
pub const BLOCK_FLAG_CONTINUED: u32 = 1 << 1;

const BLOCK_FLAG_MASK: u32 = 0x00ff_ffff;
const BLOCK_VERSION: u32 = 2;
const BLOCK_VERSION_SHIFT: u32 = 24;

/// The fixed header in front of every physical block.
///
/// Layout, little endian:
/// `block_number u32 | checksum u32 | block_length u32 | flags u32`.
/// The top byte of `flags` holds the block format version.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub number: u32,
    pub checksum: u32,
    /// Payload bytes in use, not counting the header.
    pub length: u32,
    pub flags: u32,
}

impl BlockHeader {
    pub fn to_buf(self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.number);
        LittleEndian::write_u32(&mut buf[4..8], self.checksum);
        LittleEndian::write_u32(&mut buf[8..12], self.length);
        LittleEndian::write_u32(
            &mut buf[12..16],
            (self.flags & BLOCK_FLAG_MASK) | (BLOCK_VERSION << BLOCK_VERSION_SHIFT),
        );
    }

    /// Parse a header. The checksum is not verified here, as it covers
    /// the payload as well; see `checksum()`.
    /// Return an error if the version is not one this code writes.
    pub fn from_buf(buf: &[u8]) -> StordResult<BlockHeader> {
        assert!(buf.len() >= BLOCK_HEADER_SIZE);

        let raw_flags = LittleEndian::read_u32(&buf[12..16]);
        let version = raw_flags >> BLOCK_VERSION_SHIFT;
        if version != BLOCK_VERSION {
            return Err(StordError::Engine(
                ErrorEnum::CorruptBlock,
                format!("Unknown block version: {version}"),
            ));
        }

        Ok(BlockHeader {
            number: LittleEndian::read_u32(&buf[0..4]),
            checksum: LittleEndian::read_u32(&buf[4..8]),
            length: LittleEndian::read_u32(&buf[8..12]),
            flags: raw_flags & BLOCK_FLAG_MASK,
        })
    }
}

/// CRC of a serialized header, skipping its checksum field, followed by
/// the used part of the payload.
pub fn checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    digest.update(&header[0..4]);
    digest.update(&header[8..BLOCK_HEADER_SIZE]);
    digest.update(payload);
    digest.finalize()
}
