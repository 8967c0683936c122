// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};

use crate::{
    engine::{record::Record, types::SessionId},
    stord::{ErrorEnum, StordError, StordResult},
};

/// An inclusive range of file indexes, written `N` or `N-M`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileRange {
    pub first: i32,
    pub last: i32,
}

impl FileRange {
    pub fn new(first: i32, last: i32) -> StordResult<FileRange> {
        if first < 1 || last < first {
            return Err(StordError::Engine(
                ErrorEnum::Invalid,
                format!("invalid file range {first}-{last}"),
            ));
        }
        Ok(FileRange { first, last })
    }

    pub fn contains(&self, file_index: i32) -> bool {
        (self.first..=self.last).contains(&file_index)
    }
}

impl FromStr for FileRange {
    type Err = StordError;

    fn from_str(s: &str) -> StordResult<FileRange> {
        let parse = |n: &str| {
            n.trim().parse::<i32>().map_err(|_| {
                StordError::Engine(ErrorEnum::Invalid, format!("invalid file range \"{s}\""))
            })
        };
        match s.split_once('-') {
            Some((first, last)) => FileRange::new(parse(first)?, parse(last)?),
            None => {
                let index = parse(s)?;
                FileRange::new(index, index)
            }
        }
    }
}

impl fmt::Display for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

/// Which part of a session a restore wants. The default selects every
/// record of whatever session starts at the given position.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Selection {
    /// Session expected at the start position.
    pub session: Option<SessionId>,
    /// Start time of that session, to tell it apart from a session of
    /// another daemon run with the same id.
    pub session_time: Option<DateTime<Utc>>,
    /// Empty selects every file.
    pub files: Vec<FileRange>,
    /// Empty selects every stream.
    pub streams: Vec<i32>,
}

impl Selection {
    /// Every record of the session `session` started at `session_time`.
    pub fn session(session: SessionId, session_time: DateTime<Utc>) -> Selection {
        Selection {
            session: Some(session),
            session_time: Some(session_time),
            ..Default::default()
        }
    }

    pub fn with_files(mut self, files: Vec<FileRange>) -> Selection {
        self.files = files;
        self
    }

    pub fn with_streams(mut self, streams: Vec<i32>) -> Selection {
        self.streams = streams;
        self
    }

    /// True if nothing is filtered out of the session.
    pub fn is_everything(&self) -> bool {
        self.files.is_empty() && self.streams.is_empty()
    }

    /// Check the session found at the start position against the one
    /// asked for.
    pub fn check_session(
        &self,
        session: SessionId,
        session_time: Option<DateTime<Utc>>,
    ) -> StordResult<()> {
        let id_matches = self.session.map_or(true, |want| want == session);
        let time_matches = self
            .session_time
            .map_or(true, |want| Some(want) == session_time);
        if id_matches && time_matches {
            Ok(())
        } else {
            Err(StordError::Engine(
                ErrorEnum::NotFound,
                format!(
                    "session {} at the start position is not the session asked for",
                    session
                ),
            ))
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        (self.files.is_empty() || self.files.iter().any(|r| r.contains(record.file_index)))
            && (self.streams.is_empty() || self.streams.contains(&record.stream))
    }

    /// True once `file_index` is beyond every selected file. Files are
    /// written in increasing order, so nothing after it can match.
    pub fn is_past(&self, file_index: i32) -> bool {
        self.files
            .iter()
            .map(|r| r.last)
            .max()
            .map_or(false, |last| file_index > last)
    }
}
