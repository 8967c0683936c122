// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Splitting records across blocks on write and reassembling them on read.

use crate::{
    engine::{
        block::{Block, PutOutcome},
        record::Record,
    },
    stord::{ErrorEnum, StordError, StordResult},
};

/// Where records are packed, and where full blocks go.
pub trait BlockSink {
    /// The block currently being filled with data records.
    fn block(&mut self) -> &mut Block;

    /// Seal and dispose of the current block, then leave an empty data
    /// block in its place. Volume switches happen behind this call.
    fn flush_block(&mut self) -> StordResult<()>;
}

/// Result of asking a `BlockSource` for another block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NextBlock {
    /// A data block from the volume the previous one came from.
    SameVolume,
    /// A data block from the next volume of a spanned session.
    NewVolume,
    /// The session's data is exhausted.
    End,
}

/// Where records are read from.
pub trait BlockSource {
    /// Load the next data block of the session into `block()`.
    fn next_block(&mut self) -> StordResult<NextBlock>;

    /// The block most recently loaded.
    fn block(&mut self) -> &mut Block;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriterState {
    Idle,
    /// A record is split; `written` of its bytes are in sealed blocks.
    Spanning {
        stream: i32,
        file_index: i32,
        written: usize,
    },
}

/// Packs logical records into blocks.
#[derive(Debug)]
pub struct RecordWriter {
    state: WriterState,
    records: u64,
    bytes: u64,
}

impl Default for RecordWriter {
    fn default() -> Self {
        RecordWriter::new()
    }
}

impl RecordWriter {
    pub fn new() -> RecordWriter {
        RecordWriter {
            state: WriterState::Idle,
            records: 0,
            bytes: 0,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Append one record, flushing as many blocks as it takes.
    ///
    /// If a flush fails the writer stays `Spanning`; the sealed block that
    /// failed holds the record's first `written` bytes. Passing the same
    /// record again, once that block has been disposed of, writes the rest.
    pub fn write_record<S>(&mut self, sink: &mut S, record: &Record) -> StordResult<()>
    where
        S: BlockSink + ?Sized,
    {
        if record.stream <= 0 || record.file_index <= 0 {
            return Err(StordError::Engine(
                ErrorEnum::Invalid,
                format!(
                    "data records need a positive stream and file index, got {}/{}",
                    record.stream, record.file_index
                ),
            ));
        }
        if u32::try_from(record.data.len()).is_err() {
            return Err(StordError::Engine(
                ErrorEnum::Invalid,
                format!("record of {} bytes is too long", record.data.len()),
            ));
        }

        let data = &record.data;
        let mut offset = match self.state {
            WriterState::Spanning {
                stream,
                file_index,
                written,
            } if stream == record.stream && file_index == record.file_index => {
                debug!(
                    "resuming record {}/{} at byte {}",
                    stream, file_index, written
                );
                written.min(data.len())
            }
            _ => 0,
        };
        loop {
            let continuation = offset > 0;
            match sink
                .block()
                .put_fragment(record.stream, record.file_index, &data[offset..], continuation)
            {
                PutOutcome::Written => {
                    self.state = WriterState::Idle;
                    self.records += 1;
                    self.bytes += data.len() as u64;
                    return Ok(());
                }
                PutOutcome::PartiallyWritten(rest) => {
                    offset = data.len() - rest;
                    self.state = WriterState::Spanning {
                        stream: record.stream,
                        file_index: record.file_index,
                        written: offset,
                    };
                    trace!(
                        "record {}/{} spans blocks, {} of {} bytes placed",
                        record.stream,
                        record.file_index,
                        offset,
                        data.len()
                    );
                    sink.flush_block()?;
                }
                PutOutcome::Full => {
                    if sink.block().is_empty() {
                        return Err(StordError::Engine(
                            ErrorEnum::Invalid,
                            "an empty block has no room for a record".into(),
                        ));
                    }
                    sink.flush_block()?;
                }
            }
        }
    }

    /// Flush the last, partly filled block.
    pub fn finish<S>(&mut self, sink: &mut S) -> StordResult<()>
    where
        S: BlockSink + ?Sized,
    {
        assert_eq!(self.state, WriterState::Idle, "finish with a record in flight");
        if !sink.block().is_empty() {
            sink.flush_block()?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReaderState {
    Idle,
    /// Fragments of a record collected so far.
    Spanning {
        stream: i32,
        file_index: i32,
        data: Vec<u8>,
        remaining: u32,
    },
}

/// Reassembles records from blocks.
#[derive(Debug)]
pub struct RecordReader {
    state: ReaderState,
    need_block: bool,
    last_number: u32,
    records: u64,
    bytes: u64,
}

impl Default for RecordReader {
    fn default() -> Self {
        RecordReader::new()
    }
}

impl RecordReader {
    pub fn new() -> RecordReader {
        RecordReader {
            state: ReaderState::Idle,
            need_block: true,
            last_number: 0,
            records: 0,
            bytes: 0,
        }
    }

    pub fn state(&self) -> &ReaderState {
        &self.state
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// The next complete record, or `None` once the source is exhausted.
    pub fn read_record<S>(&mut self, source: &mut S) -> StordResult<Option<Record>>
    where
        S: BlockSource + ?Sized,
    {
        loop {
            if self.need_block {
                match source.next_block()? {
                    NextBlock::End => {
                        if let ReaderState::Spanning {
                            stream,
                            file_index,
                            remaining,
                            ..
                        } = self.state
                        {
                            return Err(StordError::Engine(
                                ErrorEnum::CorruptBlock,
                                format!(
                                    "data ended inside record {stream}/{file_index}, \
                                     {remaining} bytes missing"
                                ),
                            ));
                        }
                        return Ok(None);
                    }
                    NextBlock::NewVolume => self.last_number = 0,
                    NextBlock::SameVolume => (),
                }

                let number = source.block().number();
                if number <= self.last_number {
                    return Err(StordError::Engine(
                        ErrorEnum::CorruptBlock,
                        format!(
                            "block number {} does not follow block {}",
                            number, self.last_number
                        ),
                    ));
                }
                self.last_number = number;
                self.need_block = false;
            }

            let fragment = match source.block().read_record()? {
                Some(fragment) => fragment,
                None => {
                    self.need_block = true;
                    continue;
                }
            };

            let state = std::mem::replace(&mut self.state, ReaderState::Idle);
            match state {
                ReaderState::Idle if fragment.continuation => {
                    debug!(
                        "skipping orphaned fragment of record {}/{}",
                        fragment.stream, fragment.file_index
                    );
                }
                ReaderState::Idle => {
                    if fragment.is_last() {
                        let record =
                            Record::new(fragment.stream, fragment.file_index, fragment.data.to_vec());
                        self.records += 1;
                        self.bytes += record.data.len() as u64;
                        return Ok(Some(record));
                    }
                    self.state = ReaderState::Spanning {
                        stream: fragment.stream,
                        file_index: fragment.file_index,
                        data: fragment.data.to_vec(),
                        remaining: fragment.remaining - fragment.data.len() as u32,
                    };
                }
                ReaderState::Spanning {
                    stream,
                    file_index,
                    mut data,
                    remaining,
                } => {
                    if !fragment.continuation
                        || fragment.stream != stream
                        || fragment.file_index != file_index
                        || fragment.remaining != remaining
                    {
                        return Err(StordError::Engine(
                            ErrorEnum::CorruptBlock,
                            format!(
                                "expected continuation of record {}/{} with {} bytes left, \
                                 found fragment {}/{} with {} bytes left",
                                stream,
                                file_index,
                                remaining,
                                fragment.stream,
                                fragment.file_index,
                                fragment.remaining
                            ),
                        ));
                    }
                    data.extend_from_slice(fragment.data);
                    if fragment.is_last() {
                        self.records += 1;
                        self.bytes += data.len() as u64;
                        return Ok(Some(Record::new(stream, file_index, data)));
                    }
                    self.state = ReaderState::Spanning {
                        stream,
                        file_index,
                        data,
                        remaining: remaining - fragment.data.len() as u32,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use proptest::collection::vec;

    use super::*;

    /// Collects sealed blocks in memory.
    pub struct MemSink {
        pub block: Block,
        pub blocks: Vec<Vec<u8>>,
    }

    impl MemSink {
        pub fn new(block_size: usize) -> MemSink {
            MemSink {
                block: Block::new(block_size),
                blocks: vec![],
            }
        }
    }

    impl BlockSink for MemSink {
        fn block(&mut self) -> &mut Block {
            &mut self.block
        }

        fn flush_block(&mut self) -> StordResult<()> {
            self.block.set_number(self.blocks.len() as u32 + 1);
            self.block.seal();
            self.blocks.push(self.block.as_bytes().to_vec());
            self.block.reset();
            Ok(())
        }
    }

    pub struct MemSource {
        block: Block,
        blocks: Vec<Vec<u8>>,
        next: usize,
    }

    impl MemSource {
        pub fn new(block_size: usize, blocks: Vec<Vec<u8>>) -> MemSource {
            MemSource {
                block: Block::new(block_size),
                blocks,
                next: 0,
            }
        }
    }

    impl BlockSource for MemSource {
        fn next_block(&mut self) -> StordResult<NextBlock> {
            match self.blocks.get(self.next) {
                Some(bytes) => {
                    self.block.load(bytes)?;
                    self.next += 1;
                    Ok(NextBlock::SameVolume)
                }
                None => Ok(NextBlock::End),
            }
        }

        fn block(&mut self) -> &mut Block {
            &mut self.block
        }
    }

    fn write_all(block_size: usize, records: &[Record]) -> Vec<Vec<u8>> {
        let mut sink = MemSink::new(block_size);
        let mut writer = RecordWriter::new();
        for record in records {
            writer.write_record(&mut sink, record).unwrap();
        }
        writer.finish(&mut sink).unwrap();
        sink.blocks
    }

    fn read_all(block_size: usize, blocks: Vec<Vec<u8>>) -> Vec<Record> {
        let mut source = MemSource::new(block_size, blocks);
        let mut reader = RecordReader::new();
        let mut records = vec![];
        while let Some(record) = reader.read_record(&mut source).unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    /// A 3000 byte record in 1024 byte blocks becomes three fragments and
    /// reads back as one record.
    fn test_three_fragments() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let blocks = write_all(1024, &[Record::new(2, 5, data.clone())]);
        assert_eq!(blocks.len(), 3);

        let mut lengths = vec![];
        for bytes in &blocks {
            let mut block = Block::new(1024);
            block.load(bytes).unwrap();
            let fragment = block.read_record().unwrap().unwrap();
            lengths.push(fragment.data.len());
            assert_matches!(block.read_record(), Ok(None));
        }
        assert_eq!(lengths, vec![1012, 1012, 976]);

        let records = read_all(1024, blocks);
        assert_eq!(records, vec![Record::new(2, 5, data)]);
    }

    #[test]
    /// A record that fills the rest of a block exactly is followed by the
    /// next record in a new block, with no empty continuation in between.
    fn test_exact_fit_no_continuation() {
        let records = vec![
            Record::new(2, 1, vec![1; 500]),
            Record::new(2, 2, vec![2; 1024 - 500 - 2 * 12]),
            Record::new(2, 3, vec![3; 10]),
        ];
        let blocks = write_all(1024, &records);
        assert_eq!(blocks.len(), 2);

        let mut second = Block::new(1024);
        second.load(&blocks[1]).unwrap();
        assert!(!second.is_continued());
        let fragment = second.read_record().unwrap().unwrap();
        assert_eq!(fragment.file_index, 3);
        assert!(!fragment.continuation);

        assert_eq!(read_all(1024, blocks), records);
    }

    #[test]
    fn test_truncated_span() {
        let mut blocks = write_all(256, &[Record::new(2, 1, vec![9; 1000])]);
        blocks.pop();
        let mut source = MemSource::new(256, blocks);
        let mut reader = RecordReader::new();
        assert_matches!(
            reader.read_record(&mut source),
            Err(StordError::Engine(ErrorEnum::CorruptBlock, _))
        );
    }

    #[test]
    /// Blocks delivered out of order are rejected rather than spliced.
    fn test_out_of_order() {
        let mut blocks = write_all(256, &[Record::new(2, 1, vec![9; 1000])]);
        blocks.swap(1, 2);
        let mut source = MemSource::new(256, blocks);
        let mut reader = RecordReader::new();
        assert!(reader.read_record(&mut source).is_err());
    }

    #[test]
    /// A continuation without its start, as seen when reading from the
    /// middle of a span, is skipped.
    fn test_orphan_skipped() {
        let mut blocks = write_all(
            256,
            &[Record::new(2, 1, vec![9; 300]), Record::new(2, 2, vec![8; 20])],
        );
        blocks.remove(0);
        let records = read_all(256, blocks);
        assert_eq!(records, vec![Record::new(2, 2, vec![8; 20])]);
    }

    #[test]
    fn test_rejects_label_index() {
        let mut sink = MemSink::new(256);
        let mut writer = RecordWriter::new();
        assert_matches!(
            writer.write_record(&mut sink, &Record::new(2, -2, vec![])),
            Err(StordError::Engine(ErrorEnum::Invalid, _))
        );
        assert_matches!(
            writer.write_record(&mut sink, &Record::new(0, 1, vec![])),
            Err(StordError::Engine(ErrorEnum::Invalid, _))
        );
    }

    #[test]
    /// A record whose flush failed is finished in a different sink once
    /// the sealed block that failed has been moved there.
    fn test_resume_after_failed_flush() {
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 199) as u8).collect();
        let record = Record::new(2, 3, data.clone());

        let mut writer = RecordWriter::new();

        struct FailingSink(MemSink);
        impl BlockSink for FailingSink {
            fn block(&mut self) -> &mut Block {
                &mut self.0.block
            }

            fn flush_block(&mut self) -> StordResult<()> {
                self.0.block.set_number(1);
                self.0.block.seal();
                Err(StordError::Engine(ErrorEnum::SpoolFull, "full".into()))
            }
        }
        let mut failing = FailingSink(MemSink::new(1024));
        assert_matches!(
            writer.write_record(&mut failing, &record),
            Err(StordError::Engine(ErrorEnum::SpoolFull, _))
        );
        assert_matches!(writer.state(), WriterState::Spanning { written: 1012, .. });

        let mut second = MemSink::new(1024);
        second.blocks.push(failing.0.block.as_bytes().to_vec());
        writer.write_record(&mut second, &record).unwrap();
        writer.finish(&mut second).unwrap();
        assert_eq!(writer.state(), WriterState::Idle);

        assert_eq!(read_all(1024, second.blocks), vec![record]);
    }

    proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]
        #[test]
        /// Records from one byte up to ten blocks long come back unchanged
        /// and in order.
        fn round_trip(sizes in vec(1usize..10 * 512, 1..12),
                      streams in vec(1i32..30, 12)) {
            let records: Vec<Record> = sizes
                .iter()
                .enumerate()
                .map(|(i, size)| {
                    let data = (0..*size).map(|b| (b * 7 + i) as u8).collect();
                    Record::new(streams[i], i as i32 + 1, data)
                })
                .collect();
            let blocks = write_all(512, &records);
            prop_assert_eq!(read_all(512, blocks), records);
        }
    }
}
