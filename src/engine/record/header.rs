// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    engine::types::RECORD_HEADER_SIZE,
    stord::{ErrorEnum, StordError, StordResult},
};

/// The header in front of every record fragment in a block payload.
///
/// Layout, little endian: `stream i32 | file_index i32 | data_length u32`.
/// A continuation fragment stores the negated stream id, which is why
/// stream ids must be strictly positive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecordHeader {
    pub stream: i32,
    pub file_index: i32,
    pub continuation: bool,
    /// Bytes of the logical record still to come, starting with this
    /// fragment's payload.
    pub data_length: u32,
}

impl RecordHeader {
    pub fn to_buf(self, buf: &mut [u8]) {
        assert!(self.stream > 0, "stream ids must be positive");
        let stream = if self.continuation {
            -self.stream
        } else {
            self.stream
        };
        LittleEndian::write_i32(&mut buf[0..4], stream);
        LittleEndian::write_i32(&mut buf[4..8], self.file_index);
        LittleEndian::write_u32(&mut buf[8..12], self.data_length);
    }

    pub fn from_buf(buf: &[u8]) -> StordResult<RecordHeader> {
        assert!(buf.len() >= RECORD_HEADER_SIZE);

        let raw_stream = LittleEndian::read_i32(&buf[0..4]);
        if raw_stream == 0 || raw_stream == i32::MIN {
            return Err(StordError::Engine(
                ErrorEnum::CorruptBlock,
                format!("Invalid stream id in record header: {raw_stream}"),
            ));
        }

        Ok(RecordHeader {
            stream: raw_stream.abs(),
            file_index: LittleEndian::read_i32(&buf[4..8]),
            continuation: raw_stream < 0,
            data_length: LittleEndian::read_u32(&buf[8..12]),
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::any;

    use super::*;

    proptest! {
        #[test]
        /// The continuation flag survives being packed into the stream id.
        fn record_header(stream in 1..i32::MAX,
                         file_index in any::<i32>(),
                         continuation in any::<bool>(),
                         data_length in any::<u32>()) {
            let header = RecordHeader { stream, file_index, continuation, data_length };
            let mut buf = [0u8; RECORD_HEADER_SIZE];
            header.to_buf(&mut buf);
            prop_assert_eq!(RecordHeader::from_buf(&buf).unwrap(), header);
            prop_assert_eq!(LittleEndian::read_i32(&buf[0..4]) < 0, continuation);
        }
    }

    #[test]
    fn test_zero_stream() {
        let buf = [0u8; RECORD_HEADER_SIZE];
        assert_matches!(
            RecordHeader::from_buf(&buf),
            Err(StordError::Engine(ErrorEnum::CorruptBlock, _))
        );
    }
}
