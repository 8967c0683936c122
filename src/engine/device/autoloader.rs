// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::io::Cursor;

use indexmap::IndexMap;

use crate::{
    engine::{
        block::Block,
        device::{
            cancel::CancelToken, invalid_state, tape::SequentialTape, Capabilities, Device,
            DeviceKind, DeviceState, ReadOutcome, WriteOutcome,
        },
        types::{AccessMode, DevicePosition, VolumeName},
    },
    stord::{ErrorEnum, StordError, StordResult},
};

type Cartridge = Cursor<Vec<u8>>;

/// A magazine of in-memory tape cartridges and a single drive.
///
/// A cartridge is identified by its volume name, as a barcode would
/// identify it. While a cartridge is in the drive its slot is empty.
#[derive(Debug)]
pub struct VirtualAutoloader {
    name: String,
    block_size: usize,
    capacity: Option<u64>,
    slots: IndexMap<VolumeName, Option<Cartridge>>,
    drive: Option<(VolumeName, SequentialTape<Cartridge>)>,
}

impl VirtualAutoloader {
    pub fn new(name: &str, block_size: usize, capacity: Option<u64>) -> VirtualAutoloader {
        VirtualAutoloader {
            name: name.to_owned(),
            block_size,
            capacity,
            slots: IndexMap::new(),
            drive: None,
        }
    }

    fn drive(&mut self, op: &str) -> StordResult<&mut SequentialTape<Cartridge>> {
        match self.drive.as_mut() {
            Some((_, tape)) => Ok(tape),
            None => Err(invalid_state(&self.name, DeviceState::Closed, op)),
        }
    }

    /// Return the cartridge in the drive to its slot.
    fn unload_drive(&mut self) -> StordResult<()> {
        if let Some((volume, mut tape)) = self.drive.take() {
            tape.unload()?;
            debug!("autoloader \"{}\": returned \"{}\" to its slot", self.name, volume);
            self.slots.insert(volume, Some(tape.into_image()));
        }
        Ok(())
    }
}

impl Device for VirtualAutoloader {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::VirtualAutoloader
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            concurrent_read: false,
            file_marks: true,
            changer: true,
        }
    }

    fn state(&self) -> DeviceState {
        self.drive
            .as_ref()
            .map(|(_, tape)| tape.state())
            .unwrap_or(DeviceState::Closed)
    }

    fn tell(&self) -> DevicePosition {
        self.drive
            .as_ref()
            .map(|(_, tape)| tape.tell())
            .unwrap_or_default()
    }

    fn volume(&self) -> Option<&VolumeName> {
        self.drive.as_ref().map(|(volume, _)| volume)
    }

    fn open(&mut self, volume: &VolumeName, mode: AccessMode) -> StordResult<()> {
        if self.volume() != Some(volume) {
            if !self.slots.contains_key(volume) {
                return Err(StordError::Engine(
                    ErrorEnum::NoSuchVolume,
                    format!(
                        "volume \"{}\" is not in the magazine of \"{}\"",
                        volume, self.name
                    ),
                ));
            }
            self.unload_drive()?;
            let image = self
                .slots
                .get_mut(volume)
                .and_then(|slot| slot.take())
                .ok_or_else(|| {
                    StordError::Engine(
                        ErrorEnum::NoSuchVolume,
                        format!("slot for volume \"{volume}\" is empty"),
                    )
                })?;
            info!("autoloader \"{}\": loading \"{}\"", self.name, volume);
            let tape = SequentialTape::new(&self.name, image, self.block_size, self.capacity);
            self.drive = Some((volume.clone(), tape));
        }
        self.drive("open")?.open(volume, mode)
    }

    fn write_block(&mut self, block: &Block, cancel: &CancelToken) -> StordResult<WriteOutcome> {
        self.drive("write")?.write_block(block, cancel)
    }

    fn read_block(
        &mut self,
        block: &mut Block,
        cancel: &CancelToken,
    ) -> StordResult<ReadOutcome> {
        self.drive("read")?.read_block(block, cancel)
    }

    fn position(&mut self, file: u32, block: u32, cancel: &CancelToken) -> StordResult<()> {
        self.drive("position")?.position(file, block, cancel)
    }

    fn eod(&mut self, cancel: &CancelToken) -> StordResult<u32> {
        self.drive("find end of data")?.eod(cancel)
    }

    fn weof(&mut self) -> StordResult<()> {
        self.drive("write a file mark")?.weof()
    }

    fn rewind(&mut self) -> StordResult<()> {
        match self.drive.as_mut() {
            Some((_, tape)) => tape.rewind(),
            None => Ok(()),
        }
    }

    fn unload(&mut self) -> StordResult<()> {
        self.unload_drive()
    }

    /// Place a blank cartridge in a free slot.
    fn insert_volume(&mut self, volume: &VolumeName) -> StordResult<()> {
        if self.slots.contains_key(volume) {
            return Err(StordError::Engine(
                ErrorEnum::Invalid,
                format!("volume \"{}\" is already in \"{}\"", volume, self.name),
            ));
        }
        info!("autoloader \"{}\": cartridge \"{}\" inserted", self.name, volume);
        self.slots.insert(volume.clone(), Some(Cursor::new(Vec::new())));
        Ok(())
    }

    fn volumes(&self) -> Vec<VolumeName> {
        self.slots.keys().cloned().collect()
    }

    fn can_mount(&self, volume: &VolumeName) -> bool {
        self.slots.contains_key(volume)
    }
}
