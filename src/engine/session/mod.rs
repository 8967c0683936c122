// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod catalog;
mod changer;
mod label;
mod manager;
mod reader;
mod selection;
mod writer;

pub use self::{
    catalog::{JobMedia, MemoryCatalog, VolumeCatalog, VolumeRecord, VolumeStatus},
    changer::{MediaChanger, VolumePool},
    label::{
        Label, SessionLabel, SessionLabelKind, SessionTotals, VolumeLabel, VolumeLabelKind,
        JOB_STATUS_ERROR, JOB_STATUS_OK, LABEL_STREAM,
    },
    manager::{ReadResult, SessionManager, SessionResult, WriteRequest},
    reader::VolumeReader,
    selection::{FileRange, Selection},
    writer::{write_with_retry, SessionState, VolumeSpan, VolumeWriter},
};
