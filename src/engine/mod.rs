// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use self::{
    block::{Block, BlockHeader, Fragment, PutOutcome},
    daemon::{DaemonStatus, StorageDaemon},
    device::{
        Capabilities, CancelToken, Device, DeviceKind, DeviceState, DiskFile, FaultConfig,
        ReadOutcome, SequentialTape, SimulatedFaults, StorageDevice, SyncAll, VirtualAutoloader,
        WriteOutcome,
    },
    record::{
        BlockSink, BlockSource, NextBlock, Record, RecordReader, RecordWriter, STREAM_FILE_DATA,
        STREAM_PLUGIN_DATA, STREAM_SHA256_DIGEST, STREAM_UNIX_ATTRIBUTES,
    },
    reserve::{DevicePool, DeviceStatus, ReservationStatus, ReservationToken, Watchdog},
    session::{
        FileRange, JobMedia, Label, MediaChanger, MemoryCatalog, ReadResult, Selection,
        SessionLabel, SessionLabelKind, SessionManager, SessionResult, SessionState,
        SessionTotals, VolumeCatalog, VolumeLabel, VolumeLabelKind, VolumePool, VolumeReader,
        VolumeRecord, VolumeSpan, VolumeStatus, VolumeWriter, WriteRequest,
    },
    spool::SpoolWriter,
    types::{
        validate_name, AccessMode, DevicePosition, SessionId, VolumeName, BLOCK_HEADER_SIZE,
        DEFAULT_BLOCK_SIZE, EOM_LABEL, EOS_LABEL, MAX_BLOCK_SIZE, MAX_NAME_LENGTH,
        MIN_BLOCK_SIZE, RECORD_HEADER_SIZE, SOS_LABEL, VOL_LABEL,
    },
};

pub mod block;
mod daemon;
pub mod device;
pub mod record;
pub mod reserve;
pub mod session;
pub mod spool;
mod types;
