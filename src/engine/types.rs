// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    borrow::Borrow,
    fmt::{self, Display},
    ops::Deref,
    sync::OnceLock,
};

use regex::Regex;
use serde_derive::{Deserialize, Serialize};

use crate::stord::{ErrorEnum, StordError, StordResult};

/// Default payload capacity of a block.
pub const DEFAULT_BLOCK_SIZE: usize = 65536;

/// Smallest configurable block payload; a volume label must fit.
pub const MIN_BLOCK_SIZE: usize = 1024;

/// Sanity limit for a block's payload capacity.
pub const MAX_BLOCK_SIZE: usize = 1024 * 1024;

/// Size of the serialized block header.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Size of the serialized record fragment header.
pub const RECORD_HEADER_SIZE: usize = 12;

/// Longest volume, pool or job name that fits a label field.
pub const MAX_NAME_LENGTH: usize = 128;

/// File indexes at or below zero are reserved for label records.
pub const VOL_LABEL: i32 = -2;
pub const EOM_LABEL: i32 = -3;
pub const SOS_LABEL: i32 = -4;
pub const EOS_LABEL: i32 = -5;

/// Identifies one backup or restore session on a volume.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
pub struct SessionId(pub u32);

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A position on a volume: the file (delimited by file marks on tape) and
/// the index of the block within that file.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
pub struct DevicePosition {
    pub file: u32,
    pub block: u32,
}

impl DevicePosition {
    pub fn new(file: u32, block: u32) -> DevicePosition {
        DevicePosition { file, block }
    }

    /// Start of the next block in the same file.
    pub fn next_block(self) -> StordResult<DevicePosition> {
        let block = self.block.checked_add(1).ok_or_else(|| {
            StordError::Engine(
                ErrorEnum::Invalid,
                format!("block counter overflow at file {}", self.file),
            )
        })?;
        Ok(DevicePosition { block, ..self })
    }

    /// Start of the next file.
    pub fn next_file(self) -> StordResult<DevicePosition> {
        let file = self.file.checked_add(1).ok_or_else(|| {
            StordError::Engine(ErrorEnum::Invalid, "file counter overflow".into())
        })?;
        Ok(DevicePosition { file, block: 0 })
    }
}

impl Display for DevicePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.block)
    }
}

fn name_regex() -> &'static Regex {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:\-]+$").expect("static regex is valid"))
}

/// Validate a name that is to be written to a label field.
pub fn validate_name(name: &str) -> StordResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(StordError::Engine(
            ErrorEnum::Invalid,
            format!(
                "name \"{}\" must be between 1 and {} bytes long",
                name, MAX_NAME_LENGTH
            ),
        ));
    }
    if !name_regex().is_match(name) || name.starts_with('.') {
        return Err(StordError::Engine(
            ErrorEnum::Invalid,
            format!("name \"{name}\" contains illegal characters"),
        ));
    }
    Ok(())
}

/// A validated volume name.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct VolumeName(String);

impl VolumeName {
    pub fn new(name: &str) -> StordResult<VolumeName> {
        validate_name(name)?;
        Ok(VolumeName(name.to_owned()))
    }
}

impl TryFrom<String> for VolumeName {
    type Error = StordError;

    fn try_from(name: String) -> StordResult<VolumeName> {
        validate_name(&name)?;
        Ok(VolumeName(name))
    }
}

impl From<VolumeName> for String {
    fn from(name: VolumeName) -> String {
        name.0
    }
}

impl Deref for VolumeName {
    type Target = str;

    fn deref(&self) -> &str {
        self.0.as_str()
    }
}

impl Borrow<str> for VolumeName {
    fn borrow(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for VolumeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Access requested from a device.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Deserialize,
    Serialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
pub enum AccessMode {
    Read,
    Write,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Vol-0001").is_ok());
        assert!(validate_name("Full_2024.01.01:a").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("bad name").is_err());
        assert!(validate_name("bad/name").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_LENGTH)).is_ok());
        assert!(validate_name(&"a".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_position_overflow() {
        assert!(DevicePosition::new(0, u32::MAX).next_block().is_err());
        assert!(DevicePosition::new(u32::MAX, 3).next_file().is_err());
        assert_eq!(
            DevicePosition::new(2, 7).next_file().unwrap(),
            DevicePosition::new(3, 0)
        );
    }

    #[test]
    fn test_volume_name_serde() {
        let name: VolumeName = serde_json::from_str("\"Vol-0001\"").unwrap();
        assert_eq!(&*name, "Vol-0001");
        assert!(serde_json::from_str::<VolumeName>("\"has space\"").is_err());
    }
}
