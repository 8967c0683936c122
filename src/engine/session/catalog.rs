// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    fmt::Debug,
    fs,
    io::Write,
    path::Path,
    sync::Mutex,
};

use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};

use crate::{
    engine::types::{DevicePosition, SessionId, VolumeName},
    stord::{StordError, StordResult},
};

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, strum_macros::Display,
)]
pub enum VolumeStatus {
    /// More sessions may be appended.
    Append,
    /// The volume reached end of medium.
    Full,
    /// A write to the volume failed.
    Error,
    /// Retired; the volume is only read.
    ReadOnly,
}

impl VolumeStatus {
    pub fn is_writable(self) -> bool {
        self == VolumeStatus::Append
    }
}

/// Usage of one volume.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct VolumeRecord {
    pub volume: VolumeName,
    pub pool: String,
    pub media_type: String,
    pub status: VolumeStatus,
    pub sessions: u32,
    pub blocks: u32,
    pub bytes: u64,
    pub mounts: u32,
    pub errors: u32,
    /// Position after the last block written.
    pub end: DevicePosition,
}

impl VolumeRecord {
    pub fn new(volume: &VolumeName, pool: &str, media_type: &str) -> VolumeRecord {
        VolumeRecord {
            volume: volume.clone(),
            pool: pool.to_owned(),
            media_type: media_type.to_owned(),
            status: VolumeStatus::Append,
            sessions: 0,
            blocks: 0,
            bytes: 0,
            mounts: 0,
            errors: 0,
            end: DevicePosition::default(),
        }
    }
}

/// Where part of a session's data lives: one entry per volume a session
/// wrote to.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct JobMedia {
    pub session_id: SessionId,
    pub job: String,
    pub volume: VolumeName,
    /// Index of the volume among the session's volumes, from 1.
    pub volume_index: u32,
    pub first_index: i32,
    pub last_index: i32,
    /// Position of the session's start label on this volume.
    pub start: DevicePosition,
    /// Position after the session's last block on this volume.
    pub end: DevicePosition,
    /// The volume the session came from, for every volume but its first.
    #[serde(default)]
    pub prev_volume: Option<VolumeName>,
}

/// Receives volume usage and job media entries as sessions write.
pub trait VolumeCatalog: Debug + Send + Sync {
    fn volume(&self, volume: &VolumeName) -> StordResult<Option<VolumeRecord>>;

    fn update_volume(&self, record: &VolumeRecord) -> StordResult<()>;

    fn add_job_media(&self, media: &JobMedia) -> StordResult<()>;

    fn job_media(&self, session: SessionId) -> StordResult<Vec<JobMedia>>;

    fn volumes(&self) -> StordResult<Vec<VolumeRecord>>;
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct CatalogData {
    volumes: IndexMap<VolumeName, VolumeRecord>,
    job_media: Vec<JobMedia>,
}

/// A catalog kept in memory, saved to and loaded from a JSON file.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    data: Mutex<CatalogData>,
}

impl MemoryCatalog {
    pub fn new() -> MemoryCatalog {
        MemoryCatalog::default()
    }

    /// Load a catalog saved by `save()`. A missing file is an empty
    /// catalog.
    pub fn load(path: &Path) -> StordResult<MemoryCatalog> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(MemoryCatalog {
                data: Mutex::new(serde_json::from_str(&text)?),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(MemoryCatalog::new()),
            Err(err) => Err(StordError::Chained(
                format!("failed to read catalog {}", path.display()),
                Box::new(StordError::from(err)),
            )),
        }
    }

    /// The highest session id with job media in the catalog.
    pub fn last_session_id(&self) -> StordResult<Option<SessionId>> {
        Ok(self
            .data
            .lock()?
            .job_media
            .iter()
            .map(|media| media.session_id)
            .max())
    }

    /// Write the catalog to `path`, replacing the file atomically.
    pub fn save(&self, path: &Path) -> StordResult<()> {
        let text = {
            let data = self.data.lock()?;
            serde_json::to_string_pretty(&*data)?
        };
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|err| StordError::from(err.error))?;
        Ok(())
    }
}

impl VolumeCatalog for MemoryCatalog {
    fn volume(&self, volume: &VolumeName) -> StordResult<Option<VolumeRecord>> {
        Ok(self.data.lock()?.volumes.get(volume).cloned())
    }

    fn update_volume(&self, record: &VolumeRecord) -> StordResult<()> {
        trace!(
            "catalog: volume \"{}\" {} blocks={} bytes={}",
            record.volume,
            record.status,
            record.blocks,
            record.bytes
        );
        self.data
            .lock()?
            .volumes
            .insert(record.volume.clone(), record.clone());
        Ok(())
    }

    fn add_job_media(&self, media: &JobMedia) -> StordResult<()> {
        debug!(
            "catalog: session {} on \"{}\" files {}..={} from {} to {}",
            media.session_id,
            media.volume,
            media.first_index,
            media.last_index,
            media.start,
            media.end
        );
        self.data.lock()?.job_media.push(media.clone());
        Ok(())
    }

    fn job_media(&self, session: SessionId) -> StordResult<Vec<JobMedia>> {
        Ok(self
            .data
            .lock()?
            .job_media
            .iter()
            .filter(|media| media.session_id == session)
            .cloned()
            .collect())
    }

    fn volumes(&self) -> StordResult<Vec<VolumeRecord>> {
        Ok(self.data.lock()?.volumes.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let vol = VolumeName::new("Vol-0001").unwrap();

        let catalog = MemoryCatalog::load(&path).unwrap();
        let mut record = VolumeRecord::new(&vol, "Default", "File");
        record.blocks = 12;
        catalog.update_volume(&record).unwrap();
        catalog
            .add_job_media(&JobMedia {
                session_id: SessionId(4),
                job: "NightlySave".into(),
                volume: vol.clone(),
                volume_index: 1,
                first_index: 1,
                last_index: 9,
                start: DevicePosition::new(1, 0),
                end: DevicePosition::new(1, 11),
                prev_volume: None,
            })
            .unwrap();
        catalog.save(&path).unwrap();

        let loaded = MemoryCatalog::load(&path).unwrap();
        assert_eq!(loaded.volume(&vol).unwrap(), Some(record));
        assert_eq!(loaded.job_media(SessionId(4)).unwrap().len(), 1);
        assert!(loaded.job_media(SessionId(5)).unwrap().is_empty());
        assert_eq!(loaded.last_session_id().unwrap(), Some(SessionId(4)));
        assert_eq!(MemoryCatalog::new().last_session_id().unwrap(), None);
    }
}
