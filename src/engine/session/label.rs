// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Volume and session labels. Each label is the payload of a single record
// in a block flagged as a label block; the record's file index says which
// kind of label it is.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::{
    engine::{
        block::{Block, PutOutcome},
        types::{
            validate_name, SessionId, VolumeName, EOM_LABEL, EOS_LABEL, MAX_NAME_LENGTH,
            SOS_LABEL, VOL_LABEL,
        },
    },
    stord::{ErrorEnum, StordError, StordResult},
};

const MAGIC_SIZE: usize = 32;
const VOLUME_MAGIC: &[u8] = b"stord volume label";
const SESSION_MAGIC: &[u8] = b"stord session label";
const LABEL_VERSION: u32 = 1;

/// Stream id of label records.
pub const LABEL_STREAM: i32 = 1;

fn corrupt(msg: &str) -> StordError {
    StordError::Engine(ErrorEnum::CorruptBlock, msg.into())
}

fn put_magic(buf: &mut Vec<u8>, magic: &[u8]) {
    let mut field = [0u8; MAGIC_SIZE];
    field[..magic.len()].copy_from_slice(magic);
    buf.extend_from_slice(&field);
}

fn check_magic<R: Read>(rdr: &mut R, magic: &[u8]) -> StordResult<()> {
    let mut field = [0u8; MAGIC_SIZE];
    rdr.read_exact(&mut field)?;
    if &field[..magic.len()] != magic || field[magic.len()..].iter().any(|b| *b != 0) {
        return Err(corrupt("label magic does not match"));
    }
    let version = rdr.read_u32::<LittleEndian>()?;
    if version != LABEL_VERSION {
        return Err(StordError::Engine(
            ErrorEnum::CorruptBlock,
            format!("unsupported label version {version}"),
        ));
    }
    Ok(())
}

/// Write a NUL padded name field. An empty name means "none".
fn put_name(buf: &mut Vec<u8>, name: &str) -> StordResult<()> {
    if !name.is_empty() {
        validate_name(name)?;
    }
    let mut field = [0u8; MAX_NAME_LENGTH];
    field[..name.len()].copy_from_slice(name.as_bytes());
    buf.write_all(&field)?;
    Ok(())
}

fn get_name<R: Read>(rdr: &mut R) -> StordResult<String> {
    let mut field = [0u8; MAX_NAME_LENGTH];
    rdr.read_exact(&mut field)?;
    let end = field.iter().position(|b| *b == 0).unwrap_or(MAX_NAME_LENGTH);
    let name = std::str::from_utf8(&field[..end])?;
    if !name.is_empty() {
        validate_name(name).map_err(|_| corrupt("label holds an invalid name"))?;
    }
    Ok(name.to_owned())
}

fn get_volume<R: Read>(rdr: &mut R) -> StordResult<Option<VolumeName>> {
    let name = get_name(rdr)?;
    if name.is_empty() {
        Ok(None)
    } else {
        VolumeName::try_from(name).map(Some)
    }
}

fn get_time<R: Read>(rdr: &mut R) -> StordResult<DateTime<Utc>> {
    let secs = rdr.read_i64::<LittleEndian>()?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| corrupt("label time out of range"))
}

/// The current time, to the second, as volume labels store it.
pub fn label_time() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_opt(now.timestamp(), 0).single().unwrap_or(now)
}

fn get_session_time<R: Read>(rdr: &mut R) -> StordResult<DateTime<Utc>> {
    let micros = rdr.read_i64::<LittleEndian>()?;
    Utc.timestamp_micros(micros)
        .single()
        .ok_or_else(|| corrupt("session time out of range"))
}

/// The current time, to the microsecond, as session labels store it.
/// Together with the session id it tells apart sessions written by
/// different runs of the daemon.
pub fn session_time() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_micros(now.timestamp_micros())
        .single()
        .unwrap_or(now)
}

/// Map the end of a label payload to a corrupt block rather than an
/// I/O error.
fn truncated(err: StordError) -> StordError {
    match err {
        StordError::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::UnexpectedEof => {
            corrupt("label record is truncated")
        }
        err => err,
    }
}

/// Which of the two volume label kinds a `VolumeLabel` is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeLabelKind {
    /// At the beginning of every volume.
    Volume,
    /// After the last data block of a volume a session filled.
    EndOfMedium,
}

impl VolumeLabelKind {
    pub fn file_index(self) -> i32 {
        match self {
            VolumeLabelKind::Volume => VOL_LABEL,
            VolumeLabelKind::EndOfMedium => EOM_LABEL,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeLabel {
    pub volume_id: Uuid,
    pub label_time: DateTime<Utc>,
    /// Position of the volume in a chain of spanned volumes, from 1.
    pub sequence: u32,
    pub volume: VolumeName,
    pub prev_volume: Option<VolumeName>,
    pub next_volume: Option<VolumeName>,
    pub pool: String,
    pub media_type: String,
}

impl VolumeLabel {
    pub fn new(volume: &VolumeName, pool: &str, media_type: &str) -> VolumeLabel {
        VolumeLabel {
            volume_id: Uuid::new_v4(),
            label_time: label_time(),
            sequence: 1,
            volume: volume.clone(),
            prev_volume: None,
            next_volume: None,
            pool: pool.to_owned(),
            media_type: media_type.to_owned(),
        }
    }

    pub fn encode(&self) -> StordResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(MAGIC_SIZE + 32 + 5 * MAX_NAME_LENGTH);
        put_magic(&mut buf, VOLUME_MAGIC);
        buf.write_u32::<LittleEndian>(LABEL_VERSION)?;
        buf.write_all(self.volume_id.as_bytes())?;
        buf.write_i64::<LittleEndian>(self.label_time.timestamp())?;
        buf.write_u32::<LittleEndian>(self.sequence)?;
        put_name(&mut buf, &self.volume)?;
        put_name(&mut buf, self.prev_volume.as_deref().unwrap_or(""))?;
        put_name(&mut buf, self.next_volume.as_deref().unwrap_or(""))?;
        put_name(&mut buf, &self.pool)?;
        put_name(&mut buf, &self.media_type)?;
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> StordResult<VolumeLabel> {
        VolumeLabel::decode_fields(&mut Cursor::new(data)).map_err(truncated)
    }

    fn decode_fields(rdr: &mut Cursor<&[u8]>) -> StordResult<VolumeLabel> {
        check_magic(rdr, VOLUME_MAGIC)?;
        let mut id = [0u8; 16];
        rdr.read_exact(&mut id)?;
        let label_time = get_time(rdr)?;
        let sequence = rdr.read_u32::<LittleEndian>()?;
        let volume = get_volume(rdr)?.ok_or_else(|| corrupt("volume label without a name"))?;
        Ok(VolumeLabel {
            volume_id: Uuid::from_bytes(id),
            label_time,
            sequence,
            volume,
            prev_volume: get_volume(rdr)?,
            next_volume: get_volume(rdr)?,
            pool: get_name(rdr)?,
            media_type: get_name(rdr)?,
        })
    }
}

/// Totals recorded in an end of session label.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SessionTotals {
    pub files: u32,
    pub bytes: u64,
    pub blocks: u32,
    pub start_file: u32,
    pub start_block: u32,
    pub end_file: u32,
    pub end_block: u32,
    pub status: u8,
}

/// Job status byte values for end of session labels.
pub const JOB_STATUS_OK: u8 = b'T';
pub const JOB_STATUS_ERROR: u8 = b'E';

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionLabelKind {
    Start,
    End(SessionTotals),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionLabel {
    pub kind: SessionLabelKind,
    pub session_id: SessionId,
    pub session_time: DateTime<Utc>,
    pub job: String,
    /// Index of this volume among the volumes of the session, from 1.
    pub volume_index: u32,
    /// True on every volume of a spanned session but the first.
    pub continued: bool,
}

impl SessionLabel {
    /// True if `other` is a label of the same session: same id and same
    /// session time.
    pub fn same_session(&self, other: &SessionLabel) -> bool {
        self.session_id == other.session_id && self.session_time == other.session_time
    }

    pub fn file_index(&self) -> i32 {
        match self.kind {
            SessionLabelKind::Start => SOS_LABEL,
            SessionLabelKind::End(_) => EOS_LABEL,
        }
    }

    pub fn encode(&self) -> StordResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(MAGIC_SIZE + 64 + MAX_NAME_LENGTH);
        put_magic(&mut buf, SESSION_MAGIC);
        buf.write_u32::<LittleEndian>(LABEL_VERSION)?;
        buf.write_u32::<LittleEndian>(self.session_id.0)?;
        buf.write_i64::<LittleEndian>(self.session_time.timestamp_micros())?;
        put_name(&mut buf, &self.job)?;
        buf.write_u32::<LittleEndian>(self.volume_index)?;
        buf.write_u8(u8::from(self.continued))?;
        if let SessionLabelKind::End(totals) = &self.kind {
            buf.write_u32::<LittleEndian>(totals.files)?;
            buf.write_u64::<LittleEndian>(totals.bytes)?;
            buf.write_u32::<LittleEndian>(totals.blocks)?;
            buf.write_u32::<LittleEndian>(totals.start_file)?;
            buf.write_u32::<LittleEndian>(totals.start_block)?;
            buf.write_u32::<LittleEndian>(totals.end_file)?;
            buf.write_u32::<LittleEndian>(totals.end_block)?;
            buf.write_u8(totals.status)?;
        }
        Ok(buf)
    }

    /// Decode a session label; `file_index` tells start from end.
    pub fn decode(file_index: i32, data: &[u8]) -> StordResult<SessionLabel> {
        SessionLabel::decode_fields(file_index, &mut Cursor::new(data)).map_err(truncated)
    }

    fn decode_fields(file_index: i32, rdr: &mut Cursor<&[u8]>) -> StordResult<SessionLabel> {
        check_magic(rdr, SESSION_MAGIC)?;
        let session_id = SessionId(rdr.read_u32::<LittleEndian>()?);
        let session_time = get_session_time(rdr)?;
        let job = get_name(rdr)?;
        let volume_index = rdr.read_u32::<LittleEndian>()?;
        let continued = rdr.read_u8()? != 0;
        let kind = match file_index {
            SOS_LABEL => SessionLabelKind::Start,
            EOS_LABEL => SessionLabelKind::End(SessionTotals {
                files: rdr.read_u32::<LittleEndian>()?,
                bytes: rdr.read_u64::<LittleEndian>()?,
                blocks: rdr.read_u32::<LittleEndian>()?,
                start_file: rdr.read_u32::<LittleEndian>()?,
                start_block: rdr.read_u32::<LittleEndian>()?,
                end_file: rdr.read_u32::<LittleEndian>()?,
                end_block: rdr.read_u32::<LittleEndian>()?,
                status: rdr.read_u8()?,
            }),
            other => {
                return Err(StordError::Engine(
                    ErrorEnum::CorruptBlock,
                    format!("file index {other} is not a session label"),
                ))
            }
        };
        Ok(SessionLabel {
            kind,
            session_id,
            session_time,
            job,
            volume_index,
            continued,
        })
    }
}

/// Any label, as found in a label block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Label {
    Volume(VolumeLabelKind, VolumeLabel),
    Session(SessionLabel),
}

impl Label {
    pub fn file_index(&self) -> i32 {
        match self {
            Label::Volume(kind, _) => kind.file_index(),
            Label::Session(label) => label.file_index(),
        }
    }

    pub fn encode(&self) -> StordResult<Vec<u8>> {
        match self {
            Label::Volume(_, label) => label.encode(),
            Label::Session(label) => label.encode(),
        }
    }

    /// Place the label in `block` as its only record. The block must be
    /// empty and unsealed.
    pub fn to_block(&self, block: &mut Block) -> StordResult<()> {
        let data = self.encode()?;
        block.set_label();
        match block.put_record(LABEL_STREAM, self.file_index(), &data) {
            PutOutcome::Written => Ok(()),
            _ => Err(StordError::Engine(
                ErrorEnum::Invalid,
                format!(
                    "label of {} bytes does not fit a block of {} bytes",
                    data.len(),
                    block.block_size()
                ),
            )),
        }
    }

    /// Read the label out of a sealed label block.
    pub fn from_block(block: &mut Block) -> StordResult<Label> {
        if !block.is_label() {
            return Err(corrupt("expected a label block"));
        }
        let fragment = block
            .read_record()?
            .ok_or_else(|| corrupt("empty label block"))?;
        if fragment.continuation || !fragment.is_last() {
            return Err(corrupt("label record is split"));
        }
        match fragment.file_index {
            VOL_LABEL => Ok(Label::Volume(
                VolumeLabelKind::Volume,
                VolumeLabel::decode(fragment.data)?,
            )),
            EOM_LABEL => Ok(Label::Volume(
                VolumeLabelKind::EndOfMedium,
                VolumeLabel::decode(fragment.data)?,
            )),
            SOS_LABEL | EOS_LABEL => Ok(Label::Session(SessionLabel::decode(
                fragment.file_index,
                fragment.data,
            )?)),
            other => Err(StordError::Engine(
                ErrorEnum::CorruptBlock,
                format!("unknown label type {other}"),
            )),
        }
    }
}
