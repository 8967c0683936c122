// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod framing;
pub mod header;

use serde_derive::{Deserialize, Serialize};

pub use self::framing::{
    BlockSink, BlockSource, NextBlock, ReaderState, RecordReader, RecordWriter, WriterState,
};

/// Well known stream ids. Any positive id may be used; these are the ones
/// the command line client produces.
pub const STREAM_UNIX_ATTRIBUTES: i32 = 1;
pub const STREAM_FILE_DATA: i32 = 2;
pub const STREAM_SHA256_DIGEST: i32 = 17;
pub const STREAM_PLUGIN_DATA: i32 = 27;

/// A logical record: what a client sends, and what a restore hands back.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct Record {
    pub stream: i32,
    pub file_index: i32,
    pub data: Vec<u8>,
}

impl Record {
    pub fn new(stream: i32, file_index: i32, data: Vec<u8>) -> Record {
        Record {
            stream,
            file_index,
            data,
        }
    }
}
