// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::stord::{ErrorEnum, StordError, StordResult};

/// Interrupts blocking device operations.
///
/// Clones share the abort flag, so aborting a job through any clone
/// interrupts every operation running on its behalf. Each clone may carry
/// its own deadline; device operations call `check()` around every
/// physical transfer and while they wait.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    aborted: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// A token sharing this one's abort flag that also expires after
    /// `timeout`. An earlier deadline already set is kept.
    pub fn with_timeout(&self, timeout: Duration) -> CancelToken {
        let deadline = Instant::now() + timeout;
        CancelToken {
            aborted: Arc::clone(&self.aborted),
            deadline: Some(match self.deadline {
                Some(existing) if existing < deadline => existing,
                _ => deadline,
            }),
        }
    }

    pub fn cancel(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Return an error if the job was aborted or the deadline passed.
    pub fn check(&self) -> StordResult<()> {
        if self.is_cancelled() {
            return Err(StordError::Engine(
                ErrorEnum::Cancelled,
                "operation cancelled".into(),
            ));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(StordError::Engine(
                    ErrorEnum::TimedOut,
                    "operation exceeded its deadline".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn test_cancel_shared() {
        let token = CancelToken::new();
        let op = token.with_timeout(Duration::from_secs(60));
        assert!(op.check().is_ok());
        token.cancel();
        assert_matches!(
            op.check(),
            Err(StordError::Engine(ErrorEnum::Cancelled, _))
        );
    }

    #[test]
    fn test_deadline() {
        let op = CancelToken::new().with_timeout(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(10));
        assert_matches!(op.check(), Err(StordError::Engine(ErrorEnum::TimedOut, _)));

        // A nested, longer timeout does not extend the deadline.
        let nested = op.with_timeout(Duration::from_secs(60));
        assert!(nested.check().is_err());
    }
}
