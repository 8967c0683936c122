// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fs,
    path::PathBuf,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use serde_derive::Serialize;

use crate::{
    engine::SessionId,
    stord::{DaemonConfig, ErrorEnum, StordError, StordResult},
};

/// Daemon wide counters.
#[derive(Debug, Default)]
pub struct DaemonStats {
    sessions: AtomicU64,
    blocks_written: AtomicU64,
    bytes_written: AtomicU64,
    records_written: AtomicU64,
    blocks_read: AtomicU64,
    bytes_read: AtomicU64,
    records_read: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub sessions: u64,
    pub blocks_written: u64,
    pub bytes_written: u64,
    pub records_written: u64,
    pub blocks_read: u64,
    pub bytes_read: u64,
    pub records_read: u64,
    pub spool_bytes: u64,
}

impl DaemonStats {
    pub fn session_started(&self) {
        self.sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn block_written(&self, bytes: u64) {
        self.blocks_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn block_read(&self, bytes: u64) {
        self.blocks_read.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn records_written(&self, records: u64) {
        self.records_written.fetch_add(records, Ordering::Relaxed);
    }

    pub fn records_read(&self, records: u64) {
        self.records_read.fetch_add(records, Ordering::Relaxed);
    }
}

/// State shared by every component of one daemon instance.
///
/// Constructed once from the configuration and handed to the components
/// that need it; there is no process global state.
#[derive(Debug)]
pub struct DaemonContext {
    config: DaemonConfig,
    next_session: AtomicU32,
    stats: DaemonStats,
    spool_bytes: AtomicU64,
}

impl DaemonContext {
    /// Validate the configuration and create the working and spool
    /// directories.
    pub fn new(config: DaemonConfig) -> StordResult<DaemonContext> {
        config.validate()?;
        fs::create_dir_all(&config.working_directory)?;
        fs::create_dir_all(config.spool_directory())?;
        Ok(DaemonContext {
            config,
            next_session: AtomicU32::new(1),
            stats: DaemonStats::default(),
            spool_bytes: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn working_directory(&self) -> PathBuf {
        self.config.working_directory.clone()
    }

    pub fn spool_directory(&self) -> PathBuf {
        self.config.spool_directory()
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    pub fn new_session_id(&self) -> SessionId {
        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        self.stats.session_started();
        SessionId(id)
    }

    /// Never hand out `last` or any id below it again, as when the
    /// catalog of an earlier run already records sessions up to `last`.
    pub fn skip_session_ids(&self, last: SessionId) {
        self.next_session
            .fetch_max(last.0.saturating_add(1), Ordering::SeqCst);
    }

    /// Account for `bytes` more of spool space, failing with `SpoolFull`
    /// if that would exceed the daemon wide limit.
    pub fn reserve_spool(&self, bytes: u64) -> StordResult<()> {
        let limit = self.config.max_spool_size;
        self.spool_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let total = used.checked_add(bytes)?;
                match limit {
                    Some(limit) if total > limit => None,
                    _ => Some(total),
                }
            })
            .map(|_| ())
            .map_err(|used| {
                StordError::Engine(
                    ErrorEnum::SpoolFull,
                    format!(
                        "daemon spool limit reached: {} bytes in use, {} more requested",
                        used, bytes
                    ),
                )
            })
    }

    pub fn release_spool(&self, bytes: u64) {
        let _ = self
            .spool_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    pub fn spool_bytes(&self) -> u64 {
        self.spool_bytes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions: self.stats.sessions.load(Ordering::Relaxed),
            blocks_written: self.stats.blocks_written.load(Ordering::Relaxed),
            bytes_written: self.stats.bytes_written.load(Ordering::Relaxed),
            records_written: self.stats.records_written.load(Ordering::Relaxed),
            blocks_read: self.stats.blocks_read.load(Ordering::Relaxed),
            bytes_read: self.stats.bytes_read.load(Ordering::Relaxed),
            records_read: self.stats.records_read.load(Ordering::Relaxed),
            spool_bytes: self.spool_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(max_spool_size: Option<u64>) -> (tempfile::TempDir, DaemonContext) {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            working_directory: dir.path().to_owned(),
            max_spool_size,
            ..DaemonConfig::default()
        };
        let ctx = DaemonContext::new(config).unwrap();
        (dir, ctx)
    }

    #[test]
    fn test_session_ids() {
        let (_dir, ctx) = context(None);
        assert_eq!(ctx.new_session_id(), SessionId(1));
        assert_eq!(ctx.new_session_id(), SessionId(2));
        assert_eq!(ctx.snapshot().sessions, 2);
        assert!(ctx.spool_directory().is_dir());

        ctx.skip_session_ids(SessionId(9));
        assert_eq!(ctx.new_session_id(), SessionId(10));
        ctx.skip_session_ids(SessionId(4));
        assert_eq!(ctx.new_session_id(), SessionId(11));
    }

    #[test]
    fn test_spool_limit() {
        let (_dir, ctx) = context(Some(1000));
        ctx.reserve_spool(600).unwrap();
        assert_matches!(
            ctx.reserve_spool(600),
            Err(StordError::Engine(ErrorEnum::SpoolFull, _))
        );
        ctx.release_spool(600);
        ctx.reserve_spool(1000).unwrap();
        assert_eq!(ctx.spool_bytes(), 1000);
    }
}
