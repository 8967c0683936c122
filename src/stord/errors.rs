// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt, io, str, sync};

pub type StordResult<T> = Result<T, StordError>;

/// The kind of a failure, independent of where it was raised.
///
/// End of medium and end of file are not listed here: they are ordinary
/// outcomes of device reads and writes, not errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum_macros::AsRefStr)]
pub enum ErrorEnum {
    Error,

    /// Hardware or transport failure; retried a bounded number of times.
    MediaError,
    /// A block failed validation when read back.
    CorruptBlock,
    DeviceBusy,
    OutOfMedia,
    NoSuchVolume,
    NotFound,
    Invalid,
    SpoolFull,
    Cancelled,
    TimedOut,
}

#[derive(Debug)]
pub enum StordError {
    Msg(String),
    Engine(ErrorEnum, String),
    /// An error annotated with the place on the medium where it happened.
    Positioned {
        volume: String,
        file: u32,
        block: u32,
        source: Box<StordError>,
    },
    Chained(String, Box<StordError>),
    Io(io::Error),
    Utf8(str::Utf8Error),
    Serde(serde_json::error::Error),
    Uuid(uuid::Error),
    Regex(regex::Error),
}

impl StordError {
    /// The kind of this error. Annotations are looked through, so a
    /// `CorruptBlock` stays a `CorruptBlock` however many layers wrap it.
    pub fn kind(&self) -> ErrorEnum {
        match self {
            StordError::Engine(kind, _) => *kind,
            StordError::Positioned { source, .. } | StordError::Chained(_, source) => {
                source.kind()
            }
            StordError::Io(err) => match err.kind() {
                io::ErrorKind::NotFound => ErrorEnum::NotFound,
                io::ErrorKind::TimedOut => ErrorEnum::TimedOut,
                _ => ErrorEnum::MediaError,
            },
            StordError::Msg(_)
            | StordError::Utf8(_)
            | StordError::Serde(_)
            | StordError::Uuid(_)
            | StordError::Regex(_) => ErrorEnum::Error,
        }
    }

    /// Attach a medium position to an error, unless it already carries one.
    pub fn at_position(self, volume: &str, file: u32, block: u32) -> StordError {
        match self {
            err @ StordError::Positioned { .. } => err,
            err => StordError::Positioned {
                volume: volume.to_owned(),
                file,
                block,
                source: Box::new(err),
            },
        }
    }

    /// True for the conditions that end a session but leave the device
    /// usable once it has been rewound.
    pub fn is_interrupt(&self) -> bool {
        matches!(self.kind(), ErrorEnum::Cancelled | ErrorEnum::TimedOut)
    }
}

impl fmt::Display for StordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StordError::Msg(s) => write!(f, "{s}"),
            StordError::Engine(kind, msg) => write!(f, "{}: {}", kind.as_ref(), msg),
            StordError::Positioned {
                volume,
                file,
                block,
                source,
            } => write!(
                f,
                "volume \"{volume}\" at file {file}, block {block}: {source}"
            ),
            StordError::Chained(msg, chained) => write!(f, "{msg}; Caused by: {chained}"),
            StordError::Io(err) => write!(f, "IO error: {err}"),
            StordError::Utf8(err) => write!(f, "Utf8 error: {err}"),
            StordError::Serde(err) => write!(f, "Serde error: {err}"),
            StordError::Uuid(err) => write!(f, "Uuid error: {err}"),
            StordError::Regex(err) => write!(f, "Regex error: {err}"),
        }
    }
}

impl Error for StordError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StordError::Msg(_) | StordError::Engine(_, _) => None,
            StordError::Positioned { source, .. } => Some(source.as_ref()),
            StordError::Chained(_, chained) => Some(chained.as_ref()),
            StordError::Io(err) => Some(err),
            StordError::Utf8(err) => Some(err),
            StordError::Serde(err) => Some(err),
            StordError::Uuid(err) => Some(err),
            StordError::Regex(err) => Some(err),
        }
    }
}

impl From<io::Error> for StordError {
    fn from(err: io::Error) -> StordError {
        StordError::Io(err)
    }
}

impl From<str::Utf8Error> for StordError {
    fn from(err: str::Utf8Error) -> StordError {
        StordError::Utf8(err)
    }
}

impl From<serde_json::error::Error> for StordError {
    fn from(err: serde_json::error::Error) -> StordError {
        StordError::Serde(err)
    }
}

impl From<uuid::Error> for StordError {
    fn from(err: uuid::Error) -> StordError {
        StordError::Uuid(err)
    }
}

impl From<regex::Error> for StordError {
    fn from(err: regex::Error) -> StordError {
        StordError::Regex(err)
    }
}

impl<T> From<sync::PoisonError<T>> for StordError {
    fn from(err: sync::PoisonError<T>) -> StordError {
        StordError::Msg(err.to_string())
    }
}
