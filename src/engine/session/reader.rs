// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use chrono::{DateTime, Utc};

use crate::{
    engine::{
        block::Block,
        device::{CancelToken, ReadOutcome, StorageDevice},
        record::{BlockSource, NextBlock},
        session::label::{
            Label, SessionLabel, SessionLabelKind, SessionTotals, VolumeLabelKind,
        },
        types::{AccessMode, DevicePosition, SessionId, VolumeName},
    },
    stord::{DaemonContext, ErrorEnum, StordError, StordResult},
};

/// Supplies the data blocks of one session, starting from its start label
/// and following end of medium labels onto continuation volumes.
pub struct VolumeReader<'a> {
    ctx: &'a DaemonContext,
    dev: &'a mut StorageDevice,
    cancel: &'a CancelToken,
    reader: SessionId,
    target: SessionId,
    target_time: Option<DateTime<Utc>>,
    volume_index: u32,
    job: String,
    volumes: Vec<VolumeName>,
    switched: bool,
    ended: bool,
    totals: Option<SessionTotals>,
}

impl<'a> VolumeReader<'a> {
    /// Mount `volume` and position at the session start label at `start`.
    pub fn open(
        ctx: &'a DaemonContext,
        dev: &'a mut StorageDevice,
        cancel: &'a CancelToken,
        reader: SessionId,
        volume: &VolumeName,
        start: DevicePosition,
    ) -> StordResult<VolumeReader<'a>> {
        let mut this = VolumeReader {
            ctx,
            dev,
            cancel,
            reader,
            target: SessionId(0),
            target_time: None,
            volume_index: 0,
            job: String::new(),
            volumes: vec![],
            switched: false,
            ended: false,
            totals: None,
        };
        match this.start(volume, start) {
            Ok(()) => Ok(this),
            Err(err) => {
                let err = this.annotate(err);
                this.finish();
                Err(err)
            }
        }
    }

    fn start(&mut self, volume: &VolumeName, start: DevicePosition) -> StordResult<()> {
        self.mount(volume)?;

        let op = self.io_token();
        self.dev.device().position(start.file, start.block, &op)?;
        match self.read_label()? {
            Some(Label::Session(
                label @ SessionLabel {
                    kind: SessionLabelKind::Start,
                    ..
                },
            )) => {
                info!(
                    "reading session {} of job \"{}\" from \"{}\" at {}",
                    label.session_id, label.job, volume, start
                );
                self.target = label.session_id;
                self.target_time = Some(label.session_time);
                self.volume_index = label.volume_index;
                self.job = label.job;
                Ok(())
            }
            _ => Err(StordError::Engine(
                ErrorEnum::Invalid,
                format!("no session start label on \"{}\" at {}", volume, start),
            )),
        }
    }

    /// The session being read.
    pub fn session(&self) -> SessionId {
        self.target
    }

    /// Start time of the session being read, which together with its id
    /// tells it apart from sessions of other daemon runs.
    pub fn session_time(&self) -> Option<DateTime<Utc>> {
        self.target_time
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    /// Volumes visited so far, in order.
    pub fn volumes(&self) -> &[VolumeName] {
        &self.volumes
    }

    /// Totals from the end of session label, once it has been read.
    pub fn totals(&self) -> Option<&SessionTotals> {
        self.totals.as_ref()
    }

    pub fn position(&self) -> DevicePosition {
        self.dev.device_ref().tell()
    }

    /// Annotate an error with the volume and position being read.
    pub fn annotate(&self, err: StordError) -> StordError {
        let pos = self.position();
        let volume = self
            .volumes
            .last()
            .map(|v| v.to_string())
            .unwrap_or_default();
        err.at_position(&volume, pos.file, pos.block)
    }

    /// Give up the device.
    pub fn finish(&mut self) {
        self.dev.release(self.reader);
    }

    fn io_token(&self) -> CancelToken {
        self.cancel.with_timeout(self.ctx.config().io_timeout())
    }

    fn is_target(&self, label: &SessionLabel) -> bool {
        label.session_id == self.target && Some(label.session_time) == self.target_time
    }

    /// Read one block; `None` unless it is a label.
    fn read_label(&mut self) -> StordResult<Option<Label>> {
        let op = self.io_token();
        let outcome = {
            let (device, block) = self.dev.parts();
            device.read_block(block, &op)?
        };
        match outcome {
            ReadOutcome::Block if self.dev.block().is_label() => {
                Label::from_block(self.dev.block()).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Mount `volume` and check its label.
    fn mount(&mut self, volume: &VolumeName) -> StordResult<()> {
        self.dev.open(self.reader, volume, AccessMode::Read)?;
        match self.read_label()? {
            Some(Label::Volume(VolumeLabelKind::Volume, label)) if label.volume == *volume => {
                debug!(
                    "volume \"{}\" (sequence {}) mounted for reading",
                    volume, label.sequence
                );
                self.volumes.push(volume.clone());
                Ok(())
            }
            Some(Label::Volume(VolumeLabelKind::Volume, label)) => Err(StordError::Engine(
                ErrorEnum::NoSuchVolume,
                format!(
                    "volume on \"{}\" is labeled \"{}\", expected \"{}\"",
                    self.dev.name(),
                    label.volume,
                    volume
                ),
            )),
            _ => Err(StordError::Engine(
                ErrorEnum::NoSuchVolume,
                format!("volume \"{volume}\" has no volume label"),
            )),
        }
    }

    /// Move to the volume the session continues on and find its
    /// continuation start label there.
    fn follow(&mut self, next: &VolumeName) -> StordResult<()> {
        info!(
            "session {} continues on volume \"{}\"",
            self.target, next
        );
        self.dev.device().unload()?;
        self.mount(next)?;
        loop {
            self.cancel.check()?;
            let op = self.io_token();
            let outcome = {
                let (device, block) = self.dev.parts();
                device.read_block(block, &op)?
            };
            match outcome {
                ReadOutcome::EndOfMedium => {
                    return Err(StordError::Engine(
                        ErrorEnum::CorruptBlock,
                        format!(
                            "session {} does not continue on volume \"{}\"",
                            self.target, next
                        ),
                    ))
                }
                ReadOutcome::EndOfFile => continue,
                ReadOutcome::Block => {
                    if !self.dev.block().is_label() {
                        continue;
                    }
                    if let Label::Session(
                        label @ SessionLabel {
                            kind: SessionLabelKind::Start,
                            ..
                        },
                    ) = Label::from_block(self.dev.block())?
                    {
                        if !self.is_target(&label) {
                            debug!(
                                "skipping start of session {} on \"{}\"",
                                label.session_id, next
                            );
                            continue;
                        }
                        let expected = self.volume_index.saturating_add(1);
                        if !label.continued || label.volume_index != expected {
                            return Err(StordError::Engine(
                                ErrorEnum::CorruptBlock,
                                format!(
                                    "session {} on volume \"{}\" is part {}, expected part {}",
                                    self.target, next, label.volume_index, expected
                                ),
                            ));
                        }
                        self.volume_index = label.volume_index;
                        self.switched = true;
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl BlockSource for VolumeReader<'_> {
    fn next_block(&mut self) -> StordResult<NextBlock> {
        loop {
            if self.ended {
                return Ok(NextBlock::End);
            }
            self.cancel.check()?;
            let op = self.io_token();
            let outcome = {
                let (device, block) = self.dev.parts();
                device.read_block(block, &op)?
            };
            match outcome {
                ReadOutcome::EndOfFile => {
                    trace!("file mark at {}", self.position());
                }
                ReadOutcome::EndOfMedium => {
                    warn!(
                        "data of session {} ends at {} without an end label",
                        self.target,
                        self.position()
                    );
                    self.ended = true;
                }
                ReadOutcome::Block => {
                    let size = self.dev.block().physical_size() as u64;
                    self.ctx.stats().block_read(size);
                    if !self.dev.block().is_label() {
                        let next = if self.switched {
                            NextBlock::NewVolume
                        } else {
                            NextBlock::SameVolume
                        };
                        self.switched = false;
                        return Ok(next);
                    }
                    match Label::from_block(self.dev.block())? {
                        Label::Session(label) if self.is_target(&label) => {
                            if let SessionLabelKind::End(totals) = label.kind {
                                debug!(
                                    "end of session {}: {} files, {} bytes",
                                    self.target, totals.files, totals.bytes
                                );
                                self.totals = Some(totals);
                                self.ended = true;
                            }
                        }
                        Label::Session(label) => {
                            debug!(
                                "skipping label of session {} started {}",
                                label.session_id, label.session_time
                            );
                        }
                        Label::Volume(VolumeLabelKind::EndOfMedium, label) => {
                            match label.next_volume {
                                Some(next) => self.follow(&next)?,
                                None => {
                                    warn!(
                                        "volume \"{}\" ends session {} with no continuation",
                                        label.volume, self.target
                                    );
                                    self.ended = true;
                                }
                            }
                        }
                        Label::Volume(VolumeLabelKind::Volume, label) => {
                            return Err(StordError::Engine(
                                ErrorEnum::CorruptBlock,
                                format!(
                                    "volume label for \"{}\" found inside session data",
                                    label.volume
                                ),
                            ))
                        }
                    }
                }
            }
        }
    }

    fn block(&mut self) -> &mut Block {
        self.dev.block()
    }
}
