// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use crate::engine::types::AccessMode;

/// One granted reservation.
#[derive(Clone, Debug)]
pub struct Holder {
    pub token: u64,
    pub mode: AccessMode,
    pub job: String,
    pub granted: Instant,
    pub heartbeat: Instant,
}

/// Who holds which device. Callers serialize access.
#[derive(Debug, Default)]
pub struct ReservationTable {
    holders: HashMap<String, Vec<Holder>>,
    next_token: u64,
}

impl ReservationTable {
    /// Whether `device` can be reserved for `mode` right now. Writers are
    /// exclusive; readers share only devices that read concurrently.
    pub fn can_grant(&self, device: &str, mode: AccessMode, concurrent_read: bool) -> bool {
        match self.holders.get(device) {
            None => true,
            Some(holders) if holders.is_empty() => true,
            Some(holders) => {
                mode == AccessMode::Read
                    && concurrent_read
                    && holders.iter().all(|h| h.mode == AccessMode::Read)
            }
        }
    }

    pub fn grant(&mut self, device: &str, mode: AccessMode, job: &str, now: Instant) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        self.holders
            .entry(device.to_owned())
            .or_default()
            .push(Holder {
                token,
                mode,
                job: job.to_owned(),
                granted: now,
                heartbeat: now,
            });
        token
    }

    /// Drop a reservation. False if it was already gone.
    pub fn release(&mut self, device: &str, token: u64) -> bool {
        match self.holders.get_mut(device) {
            Some(holders) => {
                let before = holders.len();
                holders.retain(|h| h.token != token);
                holders.len() != before
            }
            None => false,
        }
    }

    /// Refresh a reservation. False if it was reclaimed.
    pub fn heartbeat(&mut self, device: &str, token: u64, now: Instant) -> bool {
        match self
            .holders
            .get_mut(device)
            .and_then(|holders| holders.iter_mut().find(|h| h.token == token))
        {
            Some(holder) => {
                holder.heartbeat = now;
                true
            }
            None => false,
        }
    }

    pub fn is_held(&self, device: &str, token: u64) -> bool {
        self.holders(device).iter().any(|h| h.token == token)
    }

    /// Remove every reservation not refreshed within `timeout`, returning
    /// the device names and holders reclaimed.
    pub fn expire(&mut self, timeout: Duration, now: Instant) -> Vec<(String, Holder)> {
        let mut expired = vec![];
        for (device, holders) in self.holders.iter_mut() {
            holders.retain(|h| {
                if now.saturating_duration_since(h.heartbeat) > timeout {
                    expired.push((device.clone(), h.clone()));
                    false
                } else {
                    true
                }
            });
        }
        expired
    }

    pub fn holders(&self, device: &str) -> &[Holder] {
        self.holders.get(device).map(|h| h.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_exclusive() {
        let now = Instant::now();
        let mut table = ReservationTable::default();
        assert!(table.can_grant("tape0", AccessMode::Write, true));
        let token = table.grant("tape0", AccessMode::Write, "job1", now);
        assert!(!table.can_grant("tape0", AccessMode::Write, true));
        assert!(!table.can_grant("tape0", AccessMode::Read, true));
        assert!(table.can_grant("tape1", AccessMode::Write, false));

        assert!(table.release("tape0", token));
        assert!(!table.release("tape0", token));
        assert!(table.can_grant("tape0", AccessMode::Write, false));
    }

    #[test]
    fn test_shared_read() {
        let now = Instant::now();
        let mut table = ReservationTable::default();
        table.grant("disk0", AccessMode::Read, "restore1", now);
        assert!(table.can_grant("disk0", AccessMode::Read, true));
        assert!(!table.can_grant("disk0", AccessMode::Read, false));
        assert!(!table.can_grant("disk0", AccessMode::Write, true));
        table.grant("disk0", AccessMode::Read, "restore2", now);
        assert_eq!(table.holders("disk0").len(), 2);
    }

    #[test]
    fn test_expire() {
        let start = Instant::now();
        let mut table = ReservationTable::default();
        let stale = table.grant("tape0", AccessMode::Write, "hung", start);
        let fresh = table.grant("disk0", AccessMode::Read, "busy", start);

        let later = start + Duration::from_secs(30);
        assert!(table.heartbeat("disk0", fresh, later));
        let expired = table.expire(Duration::from_secs(10), later + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "tape0");
        assert_eq!(expired[0].1.job, "hung");

        assert!(!table.heartbeat("tape0", stale, later));
        assert!(!table.is_held("tape0", stale));
        assert!(table.is_held("disk0", fresh));
    }
}
