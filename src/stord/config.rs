// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde_derive::{Deserialize, Serialize};

use crate::{
    engine::{validate_name, FaultConfig, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE},
    stord::{ErrorEnum, StordError, StordResult},
};

fn default_media_type() -> String {
    "File".to_owned()
}

/// How a device is backed.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKindConfig {
    /// A tape drive emulated by an image file.
    Tape { path: PathBuf },
    /// A directory of disk volumes.
    Disk { directory: PathBuf },
    /// An in-memory magazine of tape cartridges.
    Autoloader {
        #[serde(default)]
        slots: Vec<String>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: DeviceKindConfig,
    /// Class of media the device takes; reservations may ask for a class
    /// instead of a device name.
    #[serde(default = "default_media_type")]
    pub media_type: String,
    /// Bytes of data a volume takes before it reports end of medium.
    #[serde(default)]
    pub capacity: Option<u64>,
    #[serde(default)]
    pub faults: Option<FaultConfig>,
}

/// Daemon configuration, read from a JSON file.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub working_directory: PathBuf,
    /// Defaults to the "spool" directory under the working directory.
    pub spool_directory: Option<PathBuf>,
    /// Payload bytes per block; the block header comes on top.
    pub block_size: usize,
    /// Pool new volumes are labeled into.
    pub pool: String,
    /// Upper bound on any single device operation.
    pub io_timeout_secs: u64,
    /// How long a session waits for the next volume before giving up.
    pub mount_timeout_secs: u64,
    pub mount_poll_millis: u64,
    pub reserve_timeout_secs: u64,
    /// A reservation not refreshed for this long is reclaimed.
    pub watchdog_timeout_secs: u64,
    /// Attempts after the first for a block write that hit a media error.
    pub max_write_retries: usize,
    pub retry_delay_millis: u64,
    /// Spool session data to disk before writing it to the device.
    pub spool_data: bool,
    pub max_job_spool_size: Option<u64>,
    pub max_spool_size: Option<u64>,
    pub devices: Vec<DeviceConfig>,
}

impl Default for DaemonConfig {
    fn default() -> DaemonConfig {
        DaemonConfig {
            working_directory: PathBuf::from("/var/lib/stord"),
            spool_directory: None,
            block_size: DEFAULT_BLOCK_SIZE,
            pool: "Default".to_owned(),
            io_timeout_secs: 300,
            mount_timeout_secs: 1800,
            mount_poll_millis: 1000,
            reserve_timeout_secs: 600,
            watchdog_timeout_secs: 600,
            max_write_retries: 3,
            retry_delay_millis: 500,
            spool_data: false,
            max_job_spool_size: None,
            max_spool_size: None,
            devices: vec![],
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> StordResult<DaemonConfig> {
        let text = fs::read_to_string(path).map_err(|err| {
            StordError::Chained(
                format!("failed to read configuration file {}", path.display()),
                Box::new(StordError::from(err)),
            )
        })?;
        let config: DaemonConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StordResult<()> {
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(StordError::Engine(
                ErrorEnum::Invalid,
                format!(
                    "block size {} is outside {}..={}",
                    self.block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
                ),
            ));
        }
        validate_name(&self.pool)?;
        if self.io_timeout_secs == 0 || self.watchdog_timeout_secs == 0 {
            return Err(StordError::Engine(
                ErrorEnum::Invalid,
                "I/O and watchdog timeouts must be positive".into(),
            ));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            validate_name(&device.name)?;
            validate_name(&device.media_type)?;
            if !names.insert(device.name.as_str()) {
                return Err(StordError::Engine(
                    ErrorEnum::Invalid,
                    format!("device name \"{}\" is used twice", device.name),
                ));
            }
            if let DeviceKindConfig::Autoloader { slots } = &device.kind {
                for slot in slots {
                    validate_name(slot)?;
                }
            }
        }
        Ok(())
    }

    pub fn spool_directory(&self) -> PathBuf {
        self.spool_directory
            .clone()
            .unwrap_or_else(|| self.working_directory.join("spool"))
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    pub fn mount_poll(&self) -> Duration {
        Duration::from_millis(self.mount_poll_millis.max(1))
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout_secs)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let config: DaemonConfig = serde_json::from_str(
            r#"{
                "working_directory": "/tmp/stord",
                "block_size": 4096,
                "devices": [
                    {"name": "tape0", "type": "tape", "path": "/tmp/stord/tape0.img",
                     "media_type": "LTO", "capacity": 1048576},
                    {"name": "disk0", "type": "disk", "directory": "/tmp/stord/vols"},
                    {"name": "changer0", "type": "autoloader", "slots": ["A-1", "A-2"],
                     "faults": {"eom_after_blocks": 10}}
                ]
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.pool, "Default");
        assert_eq!(config.devices[1].media_type, "File");
        assert_eq!(
            config.devices[2].faults.as_ref().and_then(|f| f.eom_after_blocks),
            Some(10)
        );
        assert_eq!(config.spool_directory(), PathBuf::from("/tmp/stord/spool"));
    }

    #[test]
    fn test_validate() {
        let mut config = DaemonConfig {
            block_size: 100,
            ..DaemonConfig::default()
        };
        assert!(config.validate().is_err());

        config.block_size = DEFAULT_BLOCK_SIZE;
        let device = DeviceConfig {
            name: "disk0".into(),
            kind: DeviceKindConfig::Disk {
                directory: "/tmp".into(),
            },
            media_type: default_media_type(),
            capacity: None,
            faults: None,
        };
        config.devices = vec![device.clone(), device];
        assert_matches!(
            config.validate(),
            Err(StordError::Engine(ErrorEnum::Invalid, _))
        );
    }
}
