// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod autoloader;
mod cancel;
mod disk;
mod sim;
mod tape;
mod writing;

use std::fmt::{self, Debug};

use serde_derive::{Deserialize, Serialize};

pub use self::{
    autoloader::VirtualAutoloader,
    cancel::CancelToken,
    disk::DiskFile,
    sim::{FaultConfig, SimulatedFaults},
    tape::SequentialTape,
    writing::SyncAll,
};

use crate::{
    engine::{
        block::Block,
        types::{AccessMode, DevicePosition, SessionId, VolumeName},
    },
    stord::{DeviceConfig, DeviceKindConfig, ErrorEnum, StordError, StordResult},
};

/// Where a device stands, as far as the engine is concerned.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, strum_macros::Display)]
pub enum DeviceState {
    Closed,
    Opening,
    /// Positioned at the beginning of the volume.
    AtBot,
    Active,
    /// Just past a file mark.
    AtEof,
    /// At the end of recorded data.
    AtEod,
    /// Out of room for data; only label blocks and file marks fit.
    AtEot,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, strum_macros::Display)]
pub enum DeviceKind {
    SequentialTape,
    DiskFile,
    VirtualAutoloader,
}

/// What a device can do beyond the common operation set.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Capabilities {
    /// Several read reservations may be held at once.
    pub concurrent_read: bool,
    /// File marks separate sessions on the medium.
    pub file_marks: bool,
    /// Volumes can be changed without an operator.
    pub changer: bool,
}

/// Result of writing one block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    Written,
    /// The block was not written; the volume is full.
    EndOfMedium,
}

/// Result of reading one block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    /// A validated block is in the buffer.
    Block,
    /// A file mark was crossed.
    EndOfFile,
    /// There is no more data on the volume.
    EndOfMedium,
}

/// The operation set every device kind implements.
///
/// Positions count file marks and blocks from the beginning of the
/// volume. A write that fails leaves the device positioned at the start of
/// the block that failed, so it can be retried.
pub trait Device: Debug + Send {
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    fn capabilities(&self) -> Capabilities;

    fn state(&self) -> DeviceState;

    /// The current position.
    fn tell(&self) -> DevicePosition;

    /// The volume currently mounted, if any.
    fn volume(&self) -> Option<&VolumeName>;

    /// Mount `volume` and position at its beginning. Fails with
    /// `NoSuchVolume` if the device cannot provide the volume.
    fn open(&mut self, volume: &VolumeName, mode: AccessMode) -> StordResult<()>;

    fn write_block(&mut self, block: &Block, cancel: &CancelToken) -> StordResult<WriteOutcome>;

    fn read_block(&mut self, block: &mut Block, cancel: &CancelToken)
        -> StordResult<ReadOutcome>;

    /// Move to block `block` of file `file`.
    fn position(&mut self, file: u32, block: u32, cancel: &CancelToken) -> StordResult<()>;

    /// Move to the end of recorded data, ready to append. Return the
    /// number of blocks already on the volume.
    fn eod(&mut self, cancel: &CancelToken) -> StordResult<u32>;

    fn weof(&mut self) -> StordResult<()>;

    fn rewind(&mut self) -> StordResult<()>;

    fn unload(&mut self) -> StordResult<()>;

    /// Place a new cartridge in the device's magazine.
    fn insert_volume(&mut self, volume: &VolumeName) -> StordResult<()> {
        Err(StordError::Engine(
            ErrorEnum::Invalid,
            format!(
                "device \"{}\" has no magazine to place volume \"{}\" in",
                self.name(),
                volume
            ),
        ))
    }

    /// Volumes the device can mount without operator help.
    fn volumes(&self) -> Vec<VolumeName> {
        self.volume().cloned().into_iter().collect()
    }

    /// Whether `open(volume, ..)` can succeed without operator help.
    fn can_mount(&self, _volume: &VolumeName) -> bool {
        true
    }
}

fn invalid_state(device: &str, state: DeviceState, op: &str) -> StordError {
    StordError::Engine(
        ErrorEnum::Invalid,
        format!("device \"{device}\" cannot {op} in state {state}"),
    )
}

/// A configured device together with its I/O buffer and ownership.
///
/// The block buffer belongs to the device and is reused for every
/// transfer. Only the session that opened the device may use it until it
/// is released.
pub struct StorageDevice {
    device: Box<dyn Device>,
    block: Block,
    media_type: String,
    owner: Option<SessionId>,
    needs_recovery: bool,
}

impl Debug for StorageDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageDevice")
            .field("device", &self.device)
            .field("media_type", &self.media_type)
            .field("owner", &self.owner)
            .field("needs_recovery", &self.needs_recovery)
            .finish()
    }
}

impl StorageDevice {
    pub fn new(device: Box<dyn Device>, block_size: usize, media_type: &str) -> StorageDevice {
        StorageDevice {
            device,
            block: Block::new(block_size),
            media_type: media_type.to_owned(),
            owner: None,
            needs_recovery: false,
        }
    }

    /// Build a device from its configuration.
    pub fn from_config(config: &DeviceConfig, block_size: usize) -> StordResult<StorageDevice> {
        let device: Box<dyn Device> = match &config.kind {
            DeviceKindConfig::Tape { path } => Box::new(SequentialTape::open_file(
                &config.name,
                path,
                block_size,
                config.capacity,
            )?),
            DeviceKindConfig::Disk { directory } => Box::new(DiskFile::new(
                &config.name,
                directory,
                block_size,
                config.capacity,
            )?),
            DeviceKindConfig::Autoloader { slots } => {
                let mut loader = VirtualAutoloader::new(&config.name, block_size, config.capacity);
                for slot in slots {
                    loader.insert_volume(&VolumeName::new(slot)?)?;
                }
                Box::new(loader)
            }
        };
        let device: Box<dyn Device> = match &config.faults {
            Some(faults) => Box::new(SimulatedFaults::new(device, faults.clone())),
            None => device,
        };
        Ok(StorageDevice::new(device, block_size, &config.media_type))
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn owner(&self) -> Option<SessionId> {
        self.owner
    }

    pub fn needs_recovery(&self) -> bool {
        self.needs_recovery
    }

    pub fn device(&mut self) -> &mut dyn Device {
        self.device.as_mut()
    }

    pub fn device_ref(&self) -> &dyn Device {
        self.device.as_ref()
    }

    pub fn block(&mut self) -> &mut Block {
        &mut self.block
    }

    /// The device and its buffer, borrowed together.
    pub fn parts(&mut self) -> (&mut dyn Device, &mut Block) {
        (self.device.as_mut(), &mut self.block)
    }

    /// Mount `volume` on behalf of `session`. A session switching
    /// volumes keeps its block buffer, which may hold the block that did
    /// not fit on the previous volume.
    pub fn open(
        &mut self,
        session: SessionId,
        volume: &VolumeName,
        mode: AccessMode,
    ) -> StordResult<()> {
        if let Some(owner) = self.owner {
            if owner != session {
                return Err(StordError::Engine(
                    ErrorEnum::DeviceBusy,
                    format!(
                        "device \"{}\" is in use by session {}",
                        self.name(),
                        owner
                    ),
                ));
            }
        }
        self.recover()?;
        if self.owner != Some(session) {
            self.block.reset();
        }
        self.device.open(volume, mode)?;
        self.owner = Some(session);
        Ok(())
    }

    /// End `session`'s use of the device. The volume stays mounted.
    pub fn release(&mut self, session: SessionId) {
        if self.owner == Some(session) {
            self.owner = None;
        }
        self.block.reset();
    }

    /// Flag the device as left at an unknown position.
    pub fn mark_for_recovery(&mut self) {
        warn!("device \"{}\" marked for recovery", self.name());
        self.needs_recovery = true;
    }

    /// If the device was abandoned mid operation, rewind it and forget its
    /// owner. Rewinding is best effort; the next open positions anyway.
    pub fn recover(&mut self) -> StordResult<()> {
        if !self.needs_recovery {
            return Ok(());
        }
        info!("recovering device \"{}\"", self.name());
        if self.device.state() != DeviceState::Closed {
            if let Err(err) = self.device.rewind() {
                warn!("rewind of device \"{}\" failed: {}", self.name(), err);
            }
        }
        self.owner = None;
        self.block.reset();
        self.needs_recovery = false;
        Ok(())
    }

    /// Unload the volume and give up ownership.
    pub fn shutdown(&mut self) -> StordResult<()> {
        self.owner = None;
        if self.device.state() == DeviceState::Closed {
            return Ok(());
        }
        self.device.unload()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::engine::block::PutOutcome;

    use super::*;

    #[test]
    /// A device opened by one session refuses another until released.
    fn test_device_busy() {
        let tape = SequentialTape::new("tape0", Cursor::new(Vec::new()), 512, None);
        let mut dev = StorageDevice::new(Box::new(tape), 512, "LTO");
        let vol = VolumeName::new("Vol-0001").unwrap();

        dev.open(SessionId(1), &vol, AccessMode::Write).unwrap();
        assert_matches!(
            dev.open(SessionId(2), &vol, AccessMode::Read),
            Err(StordError::Engine(ErrorEnum::DeviceBusy, _))
        );
        dev.release(SessionId(1));
        dev.open(SessionId(2), &vol, AccessMode::Read).unwrap();
        assert_eq!(dev.owner(), Some(SessionId(2)));
    }

    #[test]
    /// Remounting for the same session leaves a sealed block in place;
    /// a new owner starts with an empty one.
    fn test_reopen_keeps_block() {
        let tape = SequentialTape::new("tape0", Cursor::new(Vec::new()), 512, None);
        let mut dev = StorageDevice::new(Box::new(tape), 512, "LTO");
        let first = VolumeName::new("Vol-0001").unwrap();
        let second = VolumeName::new("Vol-0002").unwrap();

        dev.open(SessionId(1), &first, AccessMode::Write).unwrap();
        assert_eq!(dev.block().put_record(2, 1, &[7u8; 100]), PutOutcome::Written);
        dev.block().set_number(9);
        let checksum = dev.block().seal();

        dev.open(SessionId(1), &second, AccessMode::Write).unwrap();
        assert!(dev.block().is_sealed());
        assert_eq!(dev.block().restamp(1), dev.block().seal());
        assert_ne!(dev.block().seal(), checksum);

        dev.release(SessionId(1));
        dev.open(SessionId(2), &second, AccessMode::Write).unwrap();
        assert!(!dev.block().is_sealed());
        assert_eq!(dev.block().used(), 0);
    }

    #[test]
    fn test_recovery_clears_owner() {
        let tape = SequentialTape::new("tape0", Cursor::new(Vec::new()), 512, None);
        let mut dev = StorageDevice::new(Box::new(tape), 512, "LTO");
        let vol = VolumeName::new("Vol-0001").unwrap();

        dev.open(SessionId(1), &vol, AccessMode::Write).unwrap();
        dev.mark_for_recovery();
        dev.open(SessionId(3), &vol, AccessMode::Write).unwrap_err();
        dev.recover().unwrap();
        assert!(!dev.needs_recovery());
        dev.open(SessionId(3), &vol, AccessMode::Write).unwrap();
        assert_eq!(dev.device_ref().state(), DeviceState::AtBot);
    }
}
