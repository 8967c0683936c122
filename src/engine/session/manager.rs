// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};

use crate::{
    engine::{
        device::CancelToken,
        record::{Record, RecordReader, RecordWriter},
        reserve::DevicePool,
        session::{
            catalog::VolumeCatalog,
            changer::MediaChanger,
            label::{VolumeLabel, JOB_STATUS_OK},
            reader::VolumeReader,
            selection::Selection,
            writer::{VolumeSpan, VolumeWriter},
        },
        spool::SpoolWriter,
        types::{validate_name, AccessMode, DevicePosition, SessionId, VolumeName},
    },
    stord::{DaemonContext, ErrorEnum, StordError, StordResult},
};

/// What a client asks for when it starts a backup session.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct WriteRequest {
    pub job: String,
    /// Device name or media type.
    pub device: String,
    /// Volume to start on; otherwise the media changer picks one.
    #[serde(default)]
    pub volume: Option<VolumeName>,
}

/// Outcome of a completed write session.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct SessionResult {
    pub session_id: SessionId,
    pub job: String,
    pub device: String,
    pub volumes: Vec<VolumeSpan>,
    pub files: u32,
    pub records: u64,
    pub bytes: u64,
    pub blocks: u32,
    pub spooled: bool,
}

/// Outcome of a completed read session.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ReadResult {
    pub session_id: SessionId,
    pub job: String,
    pub volumes: Vec<VolumeName>,
    pub records: u64,
    pub bytes: u64,
    /// False if the data ended without an end of session label before
    /// the selected files were all read.
    pub complete: bool,
}

#[derive(Debug, Default)]
struct FileCounter {
    files: u32,
    last: i32,
}

impl FileCounter {
    fn see(&mut self, record: &Record) {
        if record.file_index != self.last {
            self.files += 1;
            self.last = record.file_index;
        }
    }
}

/// Runs write and read sessions against the reserved devices.
#[derive(Debug)]
pub struct SessionManager {
    ctx: Arc<DaemonContext>,
    pool: DevicePool,
    catalog: Arc<dyn VolumeCatalog>,
    changer: Arc<dyn MediaChanger>,
}

impl SessionManager {
    pub fn new(
        ctx: Arc<DaemonContext>,
        pool: DevicePool,
        catalog: Arc<dyn VolumeCatalog>,
        changer: Arc<dyn MediaChanger>,
    ) -> SessionManager {
        SessionManager {
            ctx,
            pool,
            catalog,
            changer,
        }
    }

    pub fn context(&self) -> &DaemonContext {
        &self.ctx
    }

    pub fn pool(&self) -> &DevicePool {
        &self.pool
    }

    pub fn catalog(&self) -> &dyn VolumeCatalog {
        self.catalog.as_ref()
    }

    /// Write `records` as one session.
    ///
    /// With spooling on, records go to a spool file first and the device
    /// is reserved only to copy them out. If the spool fills, whatever was
    /// spooled is copied out and the rest of the session is written to the
    /// device directly.
    pub fn write_session<I>(
        &self,
        request: &WriteRequest,
        records: I,
        cancel: &CancelToken,
    ) -> StordResult<SessionResult>
    where
        I: IntoIterator<Item = Record>,
    {
        validate_name(&request.job)?;
        let session = self.ctx.new_session_id();
        info!(
            "session {} for job \"{}\" on \"{}\"",
            session, request.job, request.device
        );
        let mut records = records.into_iter();
        let mut framer = RecordWriter::new();
        let mut files = FileCounter::default();

        if !self.ctx.config().spool_data {
            return self.run_writer(request, session, false, cancel, |writer| {
                for record in records {
                    cancel.check()?;
                    files.see(&record);
                    framer.write_record(writer, &record)?;
                }
                framer.finish(writer)?;
                Ok((files.files, framer.records(), framer.bytes()))
            });
        }

        let mut spool = SpoolWriter::new(&self.ctx, session, &request.job)?;
        let mut overflow = None;
        let mut spool_full = false;
        for record in records.by_ref() {
            cancel.check()?;
            files.see(&record);
            match framer.write_record(&mut spool, &record) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorEnum::SpoolFull => {
                    warn!("{}; job \"{}\" continues unspooled", err, request.job);
                    overflow = Some(record);
                    spool_full = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if !spool_full {
            match framer.finish(&mut spool) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorEnum::SpoolFull => {
                    warn!("{}; job \"{}\" continues unspooled", err, request.job);
                    spool_full = true;
                }
                Err(err) => return Err(err),
            }
        }

        self.run_writer(request, session, true, cancel, |writer| {
            spool.despool(writer)?;
            if spool_full {
                if let Some(record) = overflow {
                    framer.write_record(writer, &record)?;
                }
                for record in records {
                    cancel.check()?;
                    files.see(&record);
                    framer.write_record(writer, &record)?;
                }
                framer.finish(writer)?;
            }
            Ok((files.files, framer.records(), framer.bytes()))
        })
    }

    /// Reserve a device, mount the first volume and run `body` against
    /// it. `body` returns the files, records and bytes it wrote.
    fn run_writer<F>(
        &self,
        request: &WriteRequest,
        session: SessionId,
        spooled: bool,
        cancel: &CancelToken,
        body: F,
    ) -> StordResult<SessionResult>
    where
        F: FnOnce(&mut VolumeWriter<'_>) -> StordResult<(u32, u64, u64)>,
    {
        let token = self.pool.reserve(
            &request.device,
            AccessMode::Write,
            &request.job,
            self.ctx.config().reserve_timeout(),
        )?;
        let mut dev = token.lock_device()?;
        let mut writer = VolumeWriter::new(
            &self.ctx,
            &mut dev,
            self.catalog.as_ref(),
            self.changer.as_ref(),
            Some(&token),
            cancel,
            session,
            &request.job,
        );

        let written = writer
            .begin(request.volume.as_ref())
            .and_then(|_| body(&mut writer))
            .and_then(|(files, records, bytes)| {
                writer
                    .finish(files, bytes, JOB_STATUS_OK)
                    .map(|_| (files, records, bytes))
            });
        let (files, records, bytes) = match written {
            Ok(written) => written,
            Err(err) => {
                let err = writer.annotate(err);
                writer.abort(&err);
                return Err(err);
            }
        };

        self.ctx.stats().records_written(records);
        let result = SessionResult {
            session_id: session,
            job: request.job.clone(),
            device: token.device_name().to_owned(),
            volumes: writer.spans().to_vec(),
            files,
            records,
            bytes,
            blocks: writer.blocks(),
            spooled,
        };
        info!(
            "session {} done: {} files, {} records, {} bytes in {} blocks on {} volume(s)",
            session,
            files,
            records,
            bytes,
            result.blocks,
            result.volumes.len()
        );
        Ok(result)
    }

    /// Read back the session whose start label is at `start` on `volume`,
    /// handing each record to `callback` in order.
    pub fn read_session<F>(
        &self,
        device: &str,
        volume: &VolumeName,
        start: DevicePosition,
        cancel: &CancelToken,
        callback: F,
    ) -> StordResult<ReadResult>
    where
        F: FnMut(Record) -> StordResult<()>,
    {
        self.read_selected(device, volume, start, &Selection::default(), cancel, callback)
    }

    /// Read the records of the session starting at `start` that
    /// `selection` picks. Reading stops early once every selected file
    /// has gone by.
    pub fn read_selected<F>(
        &self,
        device: &str,
        volume: &VolumeName,
        start: DevicePosition,
        selection: &Selection,
        cancel: &CancelToken,
        mut callback: F,
    ) -> StordResult<ReadResult>
    where
        F: FnMut(Record) -> StordResult<()>,
    {
        let session = self.ctx.new_session_id();
        let job = format!("restore.{session}");
        let token = self.pool.reserve(
            device,
            AccessMode::Read,
            &job,
            self.ctx.config().reserve_timeout(),
        )?;
        let mut dev = token.lock_device()?;
        let mut reader = VolumeReader::open(&self.ctx, &mut dev, cancel, session, volume, start)?;
        if let Err(err) = selection.check_session(reader.session(), reader.session_time()) {
            reader.finish();
            return Err(err);
        }
        let mut framer = RecordReader::new();
        let mut records = 0u64;
        let mut bytes = 0u64;
        let mut stopped = false;

        let mut read = || -> StordResult<()> {
            loop {
                match framer.read_record(&mut reader)? {
                    Some(record) => {
                        if selection.is_past(record.file_index) {
                            stopped = true;
                            return Ok(());
                        }
                        if selection.matches(&record) {
                            records += 1;
                            bytes += record.data.len() as u64;
                            callback(record)?;
                        }
                        token.heartbeat()?;
                    }
                    None => return Ok(()),
                }
            }
        };
        let outcome = read();
        let outcome = outcome.map_err(|err| reader.annotate(err));
        reader.finish();
        outcome?;

        if stopped {
            debug!(
                "selection of session {} satisfied at {}",
                reader.session(),
                reader.position()
            );
        }
        if let Some(totals) = reader.totals() {
            if selection.is_everything() && totals.bytes != framer.bytes() {
                warn!(
                    "session {} read {} bytes, its end label records {}",
                    reader.session(),
                    framer.bytes(),
                    totals.bytes
                );
            }
        }
        self.ctx.stats().records_read(records);
        Ok(ReadResult {
            session_id: reader.session(),
            job: reader.job().to_owned(),
            volumes: reader.volumes().to_vec(),
            records,
            bytes,
            complete: stopped || reader.totals().is_some(),
        })
    }

    /// Read a whole session into memory.
    pub fn read_records(
        &self,
        device: &str,
        volume: &VolumeName,
        start: DevicePosition,
        cancel: &CancelToken,
    ) -> StordResult<(ReadResult, Vec<Record>)> {
        let mut records = vec![];
        let result = self.read_session(device, volume, start, cancel, |record| {
            records.push(record);
            Ok(())
        })?;
        Ok((result, records))
    }

    /// Write a volume label to the blank volume `volume` on `device`.
    pub fn label_volume(
        &self,
        device: &str,
        volume: &VolumeName,
        cancel: &CancelToken,
    ) -> StordResult<VolumeLabel> {
        let session = self.ctx.new_session_id();
        let token = self.pool.reserve(
            device,
            AccessMode::Write,
            "label",
            self.ctx.config().reserve_timeout(),
        )?;
        let mut dev = token.lock_device()?;
        let mut writer = VolumeWriter::new(
            &self.ctx,
            &mut dev,
            self.catalog.as_ref(),
            self.changer.as_ref(),
            Some(&token),
            cancel,
            session,
            "label",
        );
        writer
            .label_new_volume(volume)
            .map_err(|err| writer.annotate(err))
    }

    /// Place a blank cartridge in a device's magazine.
    pub fn insert_volume(&self, device: &str, volume: &VolumeName) -> StordResult<()> {
        let token = self.pool.reserve(
            device,
            AccessMode::Write,
            "insert",
            self.ctx.config().reserve_timeout(),
        )?;
        let mut dev = token.lock_device()?;
        dev.device().insert_volume(volume)
    }

    /// Positions of `session`'s start labels, one per volume, from the
    /// catalog.
    pub fn session_media(&self, session: SessionId) -> StordResult<Vec<(VolumeName, DevicePosition)>> {
        let mut media = self.catalog.job_media(session)?;
        if media.is_empty() {
            return Err(StordError::Engine(
                ErrorEnum::NotFound,
                format!("no media recorded for session {session}"),
            ));
        }
        media.sort_by_key(|m| m.volume_index);
        Ok(media.into_iter().map(|m| (m.volume, m.start)).collect())
    }
}
