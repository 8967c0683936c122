// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use retry::{delay::Fixed, retry_with_index, OperationResult};
use serde_derive::{Deserialize, Serialize};

use crate::{
    engine::{
        block::Block,
        device::{CancelToken, Device, ReadOutcome, StorageDevice, WriteOutcome},
        record::BlockSink,
        reserve::ReservationToken,
        session::{
            catalog::{JobMedia, VolumeCatalog, VolumeRecord, VolumeStatus},
            changer::MediaChanger,
            label::{
                session_time, Label, SessionLabel, SessionLabelKind, SessionTotals, VolumeLabel,
                VolumeLabelKind, JOB_STATUS_ERROR,
            },
        },
        types::{AccessMode, DevicePosition, SessionId, VolumeName},
    },
    stord::{DaemonContext, ErrorEnum, StordError, StordResult},
};

/// Where a write session stands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display)]
pub enum SessionState {
    Requesting,
    Mounted,
    Labeling,
    Streaming,
    Unmounting,
    Done,
}

/// The part of a session that went to one volume.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct VolumeSpan {
    pub volume: VolumeName,
    /// Position of the session start label.
    pub start: DevicePosition,
    /// Position after the last data block.
    pub end: DevicePosition,
    pub first_index: i32,
    pub last_index: i32,
}

/// Write a block, retrying media errors as the configuration allows.
/// Any other error, and end of medium, is returned at once.
pub fn write_with_retry(
    ctx: &DaemonContext,
    device: &mut dyn Device,
    block: &Block,
    cancel: &CancelToken,
) -> StordResult<WriteOutcome> {
    let config = ctx.config();
    let mut last_err = None;
    let result = retry_with_index(
        Fixed::from_millis(config.retry_delay_millis).take(config.max_write_retries),
        |attempt| {
            let op = cancel.with_timeout(config.io_timeout());
            match device.write_block(block, &op) {
                Ok(outcome) => OperationResult::Ok(outcome),
                Err(err) if err.kind() == ErrorEnum::MediaError => {
                    warn!(
                        "write of block {} to \"{}\" failed on attempt {}: {}",
                        block.number(),
                        device.name(),
                        attempt,
                        err
                    );
                    last_err = Some(err);
                    OperationResult::Retry(())
                }
                Err(err) => {
                    last_err = Some(err);
                    OperationResult::Err(())
                }
            }
        },
    );
    result.map_err(|_| {
        last_err
            .take()
            .unwrap_or_else(|| StordError::Msg("block write failed".into()))
    })
}

struct Mounted {
    label: VolumeLabel,
    record: VolumeRecord,
    span: VolumeSpan,
    volume_index: u32,
    prev_volume: Option<VolumeName>,
}

/// Writes one session's blocks to a device, mounting, labeling and
/// switching volumes as needed.
pub struct VolumeWriter<'a> {
    ctx: &'a DaemonContext,
    dev: &'a mut StorageDevice,
    catalog: &'a dyn VolumeCatalog,
    changer: &'a dyn MediaChanger,
    lease: Option<&'a ReservationToken>,
    cancel: &'a CancelToken,
    session: SessionId,
    job: String,
    session_time: DateTime<Utc>,
    state: SessionState,
    label_block: Block,
    mounted: Option<Mounted>,
    next_number: u32,
    spans: Vec<VolumeSpan>,
    tried: Vec<VolumeName>,
    blocks: u32,
}

impl<'a> VolumeWriter<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: &'a DaemonContext,
        dev: &'a mut StorageDevice,
        catalog: &'a dyn VolumeCatalog,
        changer: &'a dyn MediaChanger,
        lease: Option<&'a ReservationToken>,
        cancel: &'a CancelToken,
        session: SessionId,
        job: &str,
    ) -> VolumeWriter<'a> {
        VolumeWriter {
            ctx,
            dev,
            catalog,
            changer,
            lease,
            cancel,
            session,
            job: job.to_owned(),
            session_time: session_time(),
            state: SessionState::Requesting,
            label_block: Block::new(ctx.block_size()),
            mounted: None,
            next_number: 1,
            spans: vec![],
            tried: vec![],
            blocks: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Data blocks written so far.
    pub fn blocks(&self) -> u32 {
        self.blocks
    }

    pub fn spans(&self) -> &[VolumeSpan] {
        &self.spans
    }

    /// Name of the volume being written, if any.
    pub fn volume(&self) -> Option<&VolumeName> {
        self.mounted.as_ref().map(|m| &m.span.volume)
    }

    /// Current position, for error reports.
    pub fn position(&self) -> DevicePosition {
        self.dev.device_ref().tell()
    }

    /// Annotate an error with the volume and position being written.
    pub fn annotate(&self, err: StordError) -> StordError {
        let pos = self.position();
        let volume = self
            .volume()
            .or_else(|| self.spans.last().map(|span| &span.volume))
            .map(|v| v.to_string())
            .or_else(|| self.dev.device_ref().volume().map(|v| v.to_string()))
            .unwrap_or_default();
        err.at_position(&volume, pos.file, pos.block)
    }

    fn io_token(&self) -> CancelToken {
        self.cancel.with_timeout(self.ctx.config().io_timeout())
    }

    fn heartbeat(&self) -> StordResult<()> {
        match self.lease {
            Some(token) => token.heartbeat(),
            None => Ok(()),
        }
    }

    fn advance_number(&mut self) -> StordResult<()> {
        self.next_number = self.next_number.checked_add(1).ok_or_else(|| {
            StordError::Engine(ErrorEnum::Invalid, "block number overflow".into())
        })?;
        Ok(())
    }

    /// Mount the first volume and write the session start label.
    pub fn begin(&mut self, volume: Option<&VolumeName>) -> StordResult<()> {
        self.state = SessionState::Requesting;
        let volume = match volume {
            Some(volume) => volume.clone(),
            None => self.next_candidate()?,
        };
        self.mount(&volume, None)
    }

    /// Read whatever is at the beginning of the mounted volume. `None`
    /// means the volume is blank.
    fn read_volume_label(&mut self) -> StordResult<Option<VolumeLabel>> {
        let op = self.io_token();
        match self.dev.device().read_block(&mut self.label_block, &op)? {
            ReadOutcome::EndOfMedium => Ok(None),
            ReadOutcome::EndOfFile => Err(StordError::Engine(
                ErrorEnum::NoSuchVolume,
                "volume has no label".into(),
            )),
            ReadOutcome::Block => match Label::from_block(&mut self.label_block)? {
                Label::Volume(VolumeLabelKind::Volume, label) => Ok(Some(label)),
                other => Err(StordError::Engine(
                    ErrorEnum::NoSuchVolume,
                    format!(
                        "volume starts with label type {} instead of a volume label",
                        other.file_index()
                    ),
                )),
            },
        }
    }

    /// Write a volume label at the beginning of a blank volume.
    fn write_volume_label(&mut self, label: &VolumeLabel) -> StordResult<()> {
        self.state = SessionState::Labeling;
        self.dev.device().rewind()?;
        self.next_number = 1;
        self.write_label(&Label::Volume(VolumeLabelKind::Volume, label.clone()))?;
        self.dev.device().weof()?;
        info!(
            "labeled volume \"{}\" (sequence {}) in pool \"{}\" on \"{}\"",
            label.volume,
            label.sequence,
            label.pool,
            self.dev.name()
        );
        Ok(())
    }

    fn mount(&mut self, volume: &VolumeName, prev: Option<&VolumeLabel>) -> StordResult<()> {
        if let Some(record) = self.catalog.volume(volume)? {
            if !record.status.is_writable() {
                return Err(StordError::Engine(
                    ErrorEnum::NoSuchVolume,
                    format!("volume \"{}\" is {} and cannot be written", volume, record.status),
                ));
            }
        }
        self.tried.push(volume.clone());
        self.dev.open(self.session, volume, AccessMode::Write)?;
        self.state = SessionState::Mounted;

        let label = match self.read_volume_label()? {
            None => {
                let mut label =
                    VolumeLabel::new(volume, &self.ctx.config().pool, self.dev.media_type());
                if let Some(prev) = prev {
                    label.sequence = prev.sequence.saturating_add(1);
                    label.prev_volume = Some(prev.volume.clone());
                }
                self.write_volume_label(&label)?;
                label
            }
            Some(label) => {
                if label.volume != *volume {
                    return Err(StordError::Engine(
                        ErrorEnum::NoSuchVolume,
                        format!(
                            "volume on \"{}\" is labeled \"{}\", expected \"{}\"",
                            self.dev.name(),
                            label.volume,
                            volume
                        ),
                    ));
                }
                let op = self.io_token();
                let blocks = self.dev.device().eod(&op)?;
                self.next_number = blocks.checked_add(1).ok_or_else(|| {
                    StordError::Engine(ErrorEnum::Invalid, "block number overflow".into())
                })?;
                debug!(
                    "appending to volume \"{}\" after {} blocks",
                    volume, blocks
                );
                if let Some(prev) = prev {
                    if label.prev_volume.as_ref() != Some(&prev.volume) {
                        info!(
                            "session {} continues from \"{}\" on prelabeled volume \"{}\"",
                            self.session, prev.volume, volume
                        );
                    }
                }
                label
            }
        };

        let mut record = self
            .catalog
            .volume(volume)?
            .unwrap_or_else(|| VolumeRecord::new(volume, &label.pool, self.dev.media_type()));
        record.mounts += 1;
        record.sessions += 1;

        let volume_index = self.spans.len() as u32 + 1;
        let start = self.dev.device_ref().tell();
        self.state = SessionState::Labeling;
        self.write_label(&Label::Session(SessionLabel {
            kind: SessionLabelKind::Start,
            session_id: self.session,
            session_time: self.session_time,
            job: self.job.clone(),
            volume_index,
            continued: prev.is_some(),
        }))?;
        record.end = self.dev.device_ref().tell();
        self.catalog.update_volume(&record)?;

        self.mounted = Some(Mounted {
            label,
            record,
            span: VolumeSpan {
                volume: volume.clone(),
                start,
                end: start,
                first_index: 0,
                last_index: 0,
            },
            volume_index,
            prev_volume: prev.map(|prev| prev.volume.clone()),
        });
        self.state = SessionState::Streaming;
        info!(
            "session {} writing to volume \"{}\" on \"{}\" at {}",
            self.session,
            volume,
            self.dev.name(),
            start
        );
        Ok(())
    }

    /// Write a label block. Label blocks are accepted past end of medium.
    fn write_label(&mut self, label: &Label) -> StordResult<()> {
        self.label_block.reset();
        label.to_block(&mut self.label_block)?;
        self.label_block.set_number(self.next_number);
        self.label_block.seal();
        match write_with_retry(self.ctx, self.dev.device(), &self.label_block, self.cancel)? {
            WriteOutcome::Written => {
                let size = self.label_block.physical_size() as u64;
                if let Some(mounted) = self.mounted.as_mut() {
                    mounted.record.blocks += 1;
                    mounted.record.bytes += size;
                }
                self.ctx.stats().block_written(size);
                self.advance_number()
            }
            WriteOutcome::EndOfMedium => Err(StordError::Engine(
                ErrorEnum::OutOfMedia,
                format!("no room for a label on \"{}\"", self.dev.name()),
            )),
        }
    }

    /// Pick the next volume to write to, waiting for one to become
    /// available until the mount timeout.
    fn next_candidate(&mut self) -> StordResult<VolumeName> {
        let config = self.ctx.config();
        let started = Instant::now();
        let mut waiting = false;
        loop {
            self.cancel.check()?;

            let mut exclude = self.tried.clone();
            for record in self.catalog.volumes()? {
                if !record.status.is_writable() {
                    exclude.push(record.volume);
                }
            }
            while let Some(volume) = self.changer.next_volume(&exclude)? {
                if self.dev.device_ref().can_mount(&volume) {
                    return Ok(volume);
                }
                debug!(
                    "volume \"{}\" cannot be mounted on \"{}\"",
                    volume,
                    self.dev.name()
                );
                exclude.push(volume);
            }

            let elapsed = started.elapsed();
            if elapsed >= config.mount_timeout() {
                return Err(StordError::Engine(
                    ErrorEnum::OutOfMedia,
                    format!(
                        "no volume could be mounted on \"{}\" within {}s",
                        self.dev.name(),
                        config.mount_timeout_secs
                    ),
                ));
            }
            if !waiting {
                info!(
                    "job \"{}\" is waiting for a volume on \"{}\"",
                    self.job,
                    self.dev.name()
                );
                waiting = true;
            }
            let pause: Duration = config.mount_poll().min(config.mount_timeout() - elapsed);
            thread::sleep(pause);
            self.heartbeat()?;
        }
    }

    /// Close out the full volume and continue the session on the next.
    fn switch_volume(&mut self) -> StordResult<()> {
        self.state = SessionState::Requesting;
        let (old_label, old_volume) = match self.mounted.as_ref() {
            Some(mounted) => (mounted.label.clone(), mounted.span.volume.clone()),
            None => {
                return Err(StordError::Engine(
                    ErrorEnum::Invalid,
                    "end of medium with no volume mounted".into(),
                ))
            }
        };
        info!(
            "end of medium on volume \"{}\" at {}",
            old_volume,
            self.dev.device_ref().tell()
        );

        let next = self.next_candidate();
        let mut eom_label = old_label.clone();
        eom_label.next_volume = next.as_ref().ok().cloned();
        self.write_label(&Label::Volume(VolumeLabelKind::EndOfMedium, eom_label))?;
        self.dev.device().weof()?;

        if let Some(mut mounted) = self.mounted.take() {
            mounted.record.status = VolumeStatus::Full;
            mounted.record.end = self.dev.device_ref().tell();
            self.close_span(mounted)?;
        }
        self.dev.device().unload()?;

        let next = next?;
        self.mount(&next, Some(&old_label))
    }

    /// Record a finished span in the catalog.
    fn close_span(&mut self, mounted: Mounted) -> StordResult<()> {
        self.catalog.update_volume(&mounted.record)?;
        self.catalog.add_job_media(&JobMedia {
            session_id: self.session,
            job: self.job.clone(),
            volume: mounted.span.volume.clone(),
            volume_index: mounted.volume_index,
            first_index: mounted.span.first_index,
            last_index: mounted.span.last_index,
            start: mounted.span.start,
            end: mounted.span.end,
            prev_volume: mounted.prev_volume.clone(),
        })?;
        self.spans.push(mounted.span);
        Ok(())
    }

    /// Number, seal and write the device's block, switching volumes if
    /// the medium fills. The block is empty afterwards.
    fn commit_block(&mut self) -> StordResult<()> {
        self.heartbeat()?;
        let number = self.next_number;
        {
            let block = self.dev.block();
            if block.is_sealed() {
                block.restamp(number);
            } else {
                block.set_number(number);
                block.seal();
            }
        }

        loop {
            let outcome = {
                let (device, block) = self.dev.parts();
                write_with_retry(self.ctx, device, block, self.cancel)?
            };
            match outcome {
                WriteOutcome::Written => break,
                WriteOutcome::EndOfMedium => {
                    self.switch_volume()?;
                    let number = self.next_number;
                    self.dev.block().restamp(number);
                }
            }
        }

        let (indexes, size) = {
            let block = self.dev.block();
            (block.file_indexes(), block.physical_size() as u64)
        };
        let end = self.dev.device_ref().tell();
        if let Some(mounted) = self.mounted.as_mut() {
            mounted.record.blocks += 1;
            mounted.record.bytes += size;
            mounted.span.end = end;
            if let Some((first, last)) = indexes {
                if mounted.span.first_index == 0 {
                    mounted.span.first_index = first;
                }
                mounted.span.last_index = last;
            }
        }
        self.ctx.stats().block_written(size);
        self.blocks += 1;
        self.advance_number()?;
        self.dev.block().reset();
        Ok(())
    }

    /// Write a block taken from the spool.
    pub fn write_sealed(&mut self, bytes: &[u8]) -> StordResult<()> {
        self.dev.block().load(bytes)?;
        self.commit_block()
    }

    /// Write the end of session label and give up the device.
    pub fn finish(&mut self, files: u32, bytes: u64, status: u8) -> StordResult<()> {
        self.state = SessionState::Unmounting;
        let (start, volume_index) = match self.mounted.as_ref() {
            Some(mounted) => (mounted.span.start, mounted.volume_index),
            None => {
                return Err(StordError::Engine(
                    ErrorEnum::Invalid,
                    "session finished with no volume mounted".into(),
                ))
            }
        };
        let end = self.dev.device_ref().tell();
        self.write_label(&Label::Session(SessionLabel {
            kind: SessionLabelKind::End(SessionTotals {
                files,
                bytes,
                blocks: self.blocks,
                start_file: start.file,
                start_block: start.block,
                end_file: end.file,
                end_block: end.block,
                status,
            }),
            session_id: self.session,
            session_time: self.session_time,
            job: self.job.clone(),
            volume_index,
            continued: volume_index > 1,
        }))?;
        self.dev.device().weof()?;

        if let Some(mut mounted) = self.mounted.take() {
            mounted.record.end = self.dev.device_ref().tell();
            self.close_span(mounted)?;
        }
        self.dev.release(self.session);
        self.state = SessionState::Done;
        Ok(())
    }

    /// Leave the device in a known state after `err` ended the session.
    /// Failures here are logged, not returned.
    pub fn abort(&mut self, err: &StordError) {
        warn!("session {} aborted: {}", self.session, err);
        if err.is_interrupt() {
            self.dev.mark_for_recovery();
            if let Err(rewind_err) = self.dev.device().rewind() {
                warn!("rewind after abort failed: {}", rewind_err);
            }
        } else if let Some(mut mounted) = self.mounted.take() {
            if err.kind() != ErrorEnum::MediaError {
                let end = self.dev.device_ref().tell();
                let label = Label::Session(SessionLabel {
                    kind: SessionLabelKind::End(SessionTotals {
                        blocks: self.blocks,
                        start_file: mounted.span.start.file,
                        start_block: mounted.span.start.block,
                        end_file: end.file,
                        end_block: end.block,
                        status: JOB_STATUS_ERROR,
                        ..SessionTotals::default()
                    }),
                    session_id: self.session,
                    session_time: self.session_time,
                    job: self.job.clone(),
                    volume_index: mounted.volume_index,
                    continued: mounted.volume_index > 1,
                });
                if let Err(label_err) = self.write_label(&label) {
                    warn!("end of session label after abort failed: {}", label_err);
                }
            } else {
                mounted.record.errors += 1;
                mounted.record.status = VolumeStatus::Error;
            }
            if let Err(weof_err) = self.dev.device().weof() {
                warn!("file mark after abort failed: {}", weof_err);
            }
            mounted.record.end = self.dev.device_ref().tell();
            if let Err(catalog_err) = self.close_span(mounted) {
                warn!("catalog update after abort failed: {}", catalog_err);
            }
        }
        self.dev.block().reset();
        self.dev.release(self.session);
        self.state = SessionState::Done;
    }

    /// Label a blank volume without writing a session to it.
    pub fn label_new_volume(&mut self, volume: &VolumeName) -> StordResult<VolumeLabel> {
        self.dev.open(self.session, volume, AccessMode::Write)?;
        let result = match self.read_volume_label() {
            Ok(None) => {
                let label =
                    VolumeLabel::new(volume, &self.ctx.config().pool, self.dev.media_type());
                self.write_volume_label(&label).and_then(|_| {
                    let mut record = VolumeRecord::new(volume, &label.pool, &label.media_type);
                    record.mounts = 1;
                    record.blocks = 1;
                    record.bytes = self.label_block.physical_size() as u64;
                    record.end = self.dev.device_ref().tell();
                    self.catalog.update_volume(&record)
                })
                .map(|_| label)
            }
            Ok(Some(existing)) => Err(StordError::Engine(
                ErrorEnum::Invalid,
                format!(
                    "volume on \"{}\" is already labeled \"{}\"",
                    self.dev.name(),
                    existing.volume
                ),
            )),
            Err(err) => Err(err),
        };
        self.dev.release(self.session);
        self.state = SessionState::Done;
        result
    }
}

impl BlockSink for VolumeWriter<'_> {
    fn block(&mut self) -> &mut Block {
        self.dev.block()
    }

    fn flush_block(&mut self) -> StordResult<()> {
        self.commit_block()
    }
}
