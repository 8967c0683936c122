// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{thread, time::Duration};

use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::{
    engine::{
        block::Block,
        device::{
            cancel::CancelToken, Capabilities, Device, DeviceKind, DeviceState, ReadOutcome,
            WriteOutcome,
        },
        types::{AccessMode, DevicePosition, VolumeName},
    },
    stord::{ErrorEnum, StordError, StordResult},
};

const HANG_POLL: Duration = Duration::from_millis(5);

/// Faults to inject into a device.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Report end of medium for data blocks once a volume holds this many
    /// blocks.
    pub eom_after_blocks: Option<u32>,
    /// Fail this many writes with a media error before letting writes
    /// through.
    pub failing_writes: u32,
    /// Fail a write with a media error with probability 1/n. 0 disables.
    pub write_error_denominator: u32,
    /// Block transfers hang, until cancelled, once this many have been
    /// made.
    pub hang_after_blocks: Option<u32>,
}

/// Wraps a device and injects faults into its block transfers.
#[derive(Debug)]
pub struct SimulatedFaults {
    inner: Box<dyn Device>,
    faults: FaultConfig,
    blocks_on_volume: u32,
    transfers: u32,
    at_eot: bool,
}

impl SimulatedFaults {
    pub fn new(inner: Box<dyn Device>, faults: FaultConfig) -> SimulatedFaults {
        SimulatedFaults {
            inner,
            faults,
            blocks_on_volume: 0,
            transfers: 0,
            at_eot: false,
        }
    }

    /// Throw a denominator sided die, returning true if 1 comes up.
    /// If denominator is 0, return false.
    fn throw_die(denominator: u32) -> bool {
        denominator != 0 && rand::rng().random_ratio(1, denominator)
    }

    fn maybe_hang(&mut self, cancel: &CancelToken) -> StordResult<()> {
        if let Some(limit) = self.faults.hang_after_blocks {
            if self.transfers >= limit {
                warn!("device \"{}\": simulating a hung drive", self.inner.name());
                loop {
                    cancel.check()?;
                    thread::sleep(HANG_POLL);
                }
            }
        }
        self.transfers += 1;
        Ok(())
    }
}

impl Device for SimulatedFaults {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> DeviceKind {
        self.inner.kind()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn state(&self) -> DeviceState {
        if self.at_eot {
            DeviceState::AtEot
        } else {
            self.inner.state()
        }
    }

    fn tell(&self) -> DevicePosition {
        self.inner.tell()
    }

    fn volume(&self) -> Option<&VolumeName> {
        self.inner.volume()
    }

    fn open(&mut self, volume: &VolumeName, mode: AccessMode) -> StordResult<()> {
        self.blocks_on_volume = 0;
        self.at_eot = false;
        self.inner.open(volume, mode)
    }

    fn write_block(&mut self, block: &Block, cancel: &CancelToken) -> StordResult<WriteOutcome> {
        self.maybe_hang(cancel)?;

        if !block.is_label() {
            if self.at_eot {
                return Ok(WriteOutcome::EndOfMedium);
            }
            if let Some(limit) = self.faults.eom_after_blocks {
                if self.blocks_on_volume >= limit {
                    info!(
                        "device \"{}\": simulated end of medium after {} blocks",
                        self.inner.name(),
                        self.blocks_on_volume
                    );
                    self.at_eot = true;
                    return Ok(WriteOutcome::EndOfMedium);
                }
            }
        }

        if self.faults.failing_writes > 0 || SimulatedFaults::throw_die(self.faults.write_error_denominator)
        {
            self.faults.failing_writes = self.faults.failing_writes.saturating_sub(1);
            return Err(StordError::Engine(
                ErrorEnum::MediaError,
                format!(
                    "simulated write error on \"{}\" at {}",
                    self.inner.name(),
                    self.inner.tell()
                ),
            ));
        }

        let outcome = self.inner.write_block(block, cancel)?;
        if outcome == WriteOutcome::Written {
            self.blocks_on_volume += 1;
        }
        Ok(outcome)
    }

    fn read_block(
        &mut self,
        block: &mut Block,
        cancel: &CancelToken,
    ) -> StordResult<ReadOutcome> {
        self.maybe_hang(cancel)?;
        self.inner.read_block(block, cancel)
    }

    fn position(&mut self, file: u32, block: u32, cancel: &CancelToken) -> StordResult<()> {
        self.inner.position(file, block, cancel)
    }

    fn eod(&mut self, cancel: &CancelToken) -> StordResult<u32> {
        let blocks = self.inner.eod(cancel)?;
        self.blocks_on_volume = blocks;
        Ok(blocks)
    }

    fn weof(&mut self) -> StordResult<()> {
        self.inner.weof()
    }

    fn rewind(&mut self) -> StordResult<()> {
        self.inner.rewind()
    }

    fn unload(&mut self) -> StordResult<()> {
        self.at_eot = false;
        self.inner.unload()
    }

    fn insert_volume(&mut self, volume: &VolumeName) -> StordResult<()> {
        self.inner.insert_volume(volume)
    }

    fn volumes(&self) -> Vec<VolumeName> {
        self.inner.volumes()
    }

    fn can_mount(&self, volume: &VolumeName) -> bool {
        self.inner.can_mount(volume)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::engine::device::SequentialTape;

    fn block(number: u32) -> Block {
        let mut block = Block::new(64);
        block.set_number(number);
        block.put_record(2, 1, b"data");
        block.seal();
        block
    }

    fn wrapped(faults: FaultConfig) -> SimulatedFaults {
        let tape = SequentialTape::new("tape0", Cursor::new(Vec::new()), 64, None);
        let mut dev = SimulatedFaults::new(Box::new(tape), faults);
        dev.open(&VolumeName::new("Vol-0001").unwrap(), AccessMode::Write)
            .unwrap();
        dev
    }

    #[test]
    fn test_eom_after_blocks() {
        let cancel = CancelToken::new();
        let mut dev = wrapped(FaultConfig {
            eom_after_blocks: Some(2),
            ..FaultConfig::default()
        });
        assert_eq!(dev.write_block(&block(1), &cancel).unwrap(), WriteOutcome::Written);
        assert_eq!(dev.write_block(&block(2), &cancel).unwrap(), WriteOutcome::Written);
        assert_eq!(
            dev.write_block(&block(3), &cancel).unwrap(),
            WriteOutcome::EndOfMedium
        );
        assert_eq!(dev.state(), DeviceState::AtEot);
        assert_eq!(dev.tell(), DevicePosition::new(0, 2));
    }

    #[test]
    /// A failed write does not move the device.
    fn test_failing_writes() {
        let cancel = CancelToken::new();
        let mut dev = wrapped(FaultConfig {
            failing_writes: 2,
            ..FaultConfig::default()
        });
        for _ in 0..2 {
            assert_matches!(
                dev.write_block(&block(1), &cancel),
                Err(StordError::Engine(ErrorEnum::MediaError, _))
            );
            assert_eq!(dev.tell(), DevicePosition::new(0, 0));
        }
        assert_eq!(dev.write_block(&block(1), &cancel).unwrap(), WriteOutcome::Written);
    }

    #[test]
    fn test_hang_interrupted() {
        let mut dev = wrapped(FaultConfig {
            hang_after_blocks: Some(0),
            ..FaultConfig::default()
        });
        let cancel = CancelToken::new().with_timeout(Duration::from_millis(20));
        assert_matches!(
            dev.write_block(&block(1), &cancel),
            Err(StordError::Engine(ErrorEnum::TimedOut, _))
        );
    }

    #[test]
    fn test_throw_die() {
        assert!(!SimulatedFaults::throw_die(0));
        assert!(SimulatedFaults::throw_die(1));
    }
}
