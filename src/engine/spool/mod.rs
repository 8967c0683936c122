// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Staging a session's blocks on local disk so the device is only held
// while they are copied out.

use std::io::{BufReader, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tempfile::NamedTempFile;

use crate::{
    engine::{
        block::{Block, BlockHeader},
        record::BlockSink,
        session::VolumeWriter,
        types::{SessionId, BLOCK_HEADER_SIZE},
    },
    stord::{DaemonContext, ErrorEnum, StordError, StordResult},
};

/// Bytes in front of every block in a spool file.
const ENTRY_HEADER_SIZE: u64 = 4;

/// A `BlockSink` that appends sealed blocks to a spool file.
///
/// Blocks are numbered from 1 in the order they are spooled; the numbers
/// are replaced when the blocks are written to a volume. A flush that
/// would pass the job or daemon spool limit fails with `SpoolFull` and
/// leaves the sealed block in place, see `pending()`.
pub struct SpoolWriter<'a> {
    ctx: &'a DaemonContext,
    job: String,
    file: NamedTempFile,
    block: Block,
    size: u64,
    blocks: u32,
    limit: Option<u64>,
}

impl<'a> SpoolWriter<'a> {
    pub fn new(ctx: &'a DaemonContext, session: SessionId, job: &str) -> StordResult<SpoolWriter<'a>> {
        let file = tempfile::Builder::new()
            .prefix(&format!("{job}.{session}."))
            .suffix(".spool")
            .tempfile_in(ctx.spool_directory())?;
        debug!("spooling job \"{}\" to {}", job, file.path().display());
        Ok(SpoolWriter {
            ctx,
            job: job.to_owned(),
            file,
            block: Block::new(ctx.block_size()),
            size: 0,
            blocks: 0,
            limit: ctx.config().max_job_spool_size,
        })
    }

    /// Bytes in the spool file.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    /// The sealed block a failed flush left behind, if any.
    pub fn pending(&self) -> Option<&[u8]> {
        if self.block.is_sealed() {
            Some(self.block.as_bytes())
        } else {
            None
        }
    }

    fn append(&mut self) -> StordResult<()> {
        let len = self.block.physical_size();
        let entry = ENTRY_HEADER_SIZE + len as u64;
        if let Some(limit) = self.limit {
            if self.size + entry > limit {
                return Err(StordError::Engine(
                    ErrorEnum::SpoolFull,
                    format!(
                        "job \"{}\" reached its spool limit of {} bytes",
                        self.job, limit
                    ),
                ));
            }
        }
        self.ctx.reserve_spool(entry)?;

        let file = self.file.as_file_mut();
        let written = file
            .write_u32::<LittleEndian>(len as u32)
            .and_then(|_| file.write_all(self.block.as_bytes()));
        if let Err(err) = written {
            self.ctx.release_spool(entry);
            return Err(StordError::Engine(
                ErrorEnum::SpoolFull,
                format!("write to spool file {} failed: {}", self.file.path().display(), err),
            ));
        }
        self.size += entry;
        self.blocks += 1;
        Ok(())
    }

    /// Copy every spooled block, then any pending block, to `writer`, and
    /// empty the spool. Returns the number of blocks copied.
    pub fn despool(&mut self, writer: &mut VolumeWriter<'_>) -> StordResult<u32> {
        self.file.as_file_mut().flush()?;
        info!(
            "despooling {} blocks ({} bytes) of job \"{}\"",
            self.blocks, self.size, self.job
        );
        let mut reader = BufReader::new(self.file.reopen()?);
        let mut buf = vec![0; self.block.physical_size()];
        for expected in 1..=self.blocks {
            let len = reader.read_u32::<LittleEndian>()? as usize;
            if !(BLOCK_HEADER_SIZE..=buf.len()).contains(&len) {
                return Err(StordError::Engine(
                    ErrorEnum::CorruptBlock,
                    format!("spool entry {expected} has impossible length {len}"),
                ));
            }
            reader.read_exact(&mut buf[..len])?;
            let number = BlockHeader::from_buf(&buf[..BLOCK_HEADER_SIZE])?.number;
            if number != expected {
                return Err(StordError::Engine(
                    ErrorEnum::CorruptBlock,
                    format!("spool out of sequence: found block {number}, expected {expected}"),
                ));
            }
            writer.write_sealed(&buf[..len])?;
        }

        let mut copied = self.blocks;
        if let Some(bytes) = self.pending() {
            writer.write_sealed(bytes)?;
            copied += 1;
        }
        self.block.reset();

        self.file.as_file_mut().set_len(0)?;
        self.ctx.release_spool(self.size);
        self.size = 0;
        self.blocks = 0;
        Ok(copied)
    }
}

impl BlockSink for SpoolWriter<'_> {
    fn block(&mut self) -> &mut Block {
        &mut self.block
    }

    fn flush_block(&mut self) -> StordResult<()> {
        if !self.block.is_sealed() {
            self.block.set_number(self.blocks + 1);
            self.block.seal();
        }
        self.append()?;
        self.block.reset();
        Ok(())
    }
}

impl Drop for SpoolWriter<'_> {
    fn drop(&mut self) {
        self.ctx.release_spool(self.size);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        engine::record::{Record, RecordWriter},
        stord::DaemonConfig,
    };

    use super::*;

    fn context(job_limit: Option<u64>, limit: Option<u64>) -> (tempfile::TempDir, DaemonContext) {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            working_directory: dir.path().to_owned(),
            block_size: 1024,
            max_job_spool_size: job_limit,
            max_spool_size: limit,
            ..DaemonConfig::default()
        };
        (dir, DaemonContext::new(config).unwrap())
    }

    #[test]
    fn test_spool_accounting() {
        let (_dir, ctx) = context(None, None);
        {
            let mut spool = SpoolWriter::new(&ctx, SessionId(1), "job").unwrap();
            let mut writer = RecordWriter::new();
            writer
                .write_record(&mut spool, &Record::new(2, 1, vec![7; 3000]))
                .unwrap();
            writer.finish(&mut spool).unwrap();
            assert_eq!(spool.blocks(), 3);
            assert_eq!(spool.size(), 3 * (4 + 1040));
            assert_eq!(ctx.spool_bytes(), spool.size());
            assert!(spool.pending().is_none());
        }
        assert_eq!(ctx.spool_bytes(), 0);
        assert_eq!(std::fs::read_dir(ctx.spool_directory()).unwrap().count(), 0);
    }

    #[test]
    /// Hitting the job limit keeps the sealed block for a later write.
    fn test_job_limit() {
        let (_dir, ctx) = context(Some(2 * (4 + 1040)), None);
        let mut spool = SpoolWriter::new(&ctx, SessionId(1), "job").unwrap();
        let mut writer = RecordWriter::new();
        assert_matches!(
            writer.write_record(&mut spool, &Record::new(2, 1, vec![1; 5000])),
            Err(StordError::Engine(ErrorEnum::SpoolFull, _))
        );
        assert_eq!(spool.blocks(), 2);
        assert!(spool.pending().is_some());
    }

    #[test]
    fn test_daemon_limit() {
        let (_dir, ctx) = context(None, Some(4 + 1040));
        let mut first = SpoolWriter::new(&ctx, SessionId(1), "a").unwrap();
        let mut second = SpoolWriter::new(&ctx, SessionId(2), "b").unwrap();
        first.block().put_record(2, 1, b"a");
        first.flush_block().unwrap();
        second.block().put_record(2, 1, b"b");
        assert_matches!(
            second.flush_block(),
            Err(StordError::Engine(ErrorEnum::SpoolFull, _))
        );
        drop(first);
        second.flush_block().unwrap();
    }
}
