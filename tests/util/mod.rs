// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![allow(dead_code)]

use std::{io::Cursor, path::Path, sync::Arc, sync::Once};

use env_logger::{Builder, Env};

use libstord::{
    engine::{
        DevicePool, DiskFile, FaultConfig, MemoryCatalog, Record, SequentialTape, SimulatedFaults,
        StorageDaemon, StorageDevice, VirtualAutoloader, VolumeName, VolumePool,
        BLOCK_HEADER_SIZE,
    },
    stord::{DaemonConfig, DaemonContext},
};

pub const BLOCK_SIZE: usize = 1024;

/// Payload bytes of a record that exactly fills one block.
pub const BLOCK_RECORD: usize = BLOCK_SIZE - 12;

static LOGGER: Once = Once::new();

/// Log to the test harness; RUST_LOG overrides the default level.
pub fn init_logger() {
    LOGGER.call_once(|| {
        let _ = Builder::from_env(Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    });
}

/// A configuration that does not keep tests waiting.
pub fn test_config(dir: &Path) -> DaemonConfig {
    DaemonConfig {
        working_directory: dir.to_owned(),
        block_size: BLOCK_SIZE,
        io_timeout_secs: 30,
        mount_timeout_secs: 0,
        mount_poll_millis: 10,
        reserve_timeout_secs: 10,
        retry_delay_millis: 1,
        ..DaemonConfig::default()
    }
}

pub fn daemon(config: DaemonConfig, devices: Vec<StorageDevice>, volumes: &[&str]) -> StorageDaemon {
    init_logger();
    let ctx = Arc::new(DaemonContext::new(config).unwrap());
    let pool = DevicePool::new(devices, ctx.config().watchdog_timeout()).unwrap();
    let changer = VolumePool::new(volumes.iter().map(|v| volume(v)));
    let catalog = MemoryCatalog::load(&ctx.working_directory().join("catalog.json")).unwrap();
    StorageDaemon::from_parts(ctx, pool, Arc::new(catalog), changer)
}

pub fn volume(name: &str) -> VolumeName {
    VolumeName::new(name).unwrap()
}

pub fn disk(name: &str, dir: &Path) -> StorageDevice {
    let disk = DiskFile::new(name, dir, BLOCK_SIZE, None).unwrap();
    StorageDevice::new(Box::new(disk), BLOCK_SIZE, "File")
}

/// A disk whose volumes fill up after `blocks` physical blocks.
pub fn small_disk(name: &str, dir: &Path, blocks: u64) -> StorageDevice {
    let capacity = blocks * (BLOCK_SIZE + BLOCK_HEADER_SIZE) as u64;
    let disk = DiskFile::new(name, dir, BLOCK_SIZE, Some(capacity)).unwrap();
    StorageDevice::new(Box::new(disk), BLOCK_SIZE, "File")
}

pub fn tape(name: &str) -> StorageDevice {
    let tape = SequentialTape::new(name, Cursor::new(Vec::new()), BLOCK_SIZE, None);
    StorageDevice::new(Box::new(tape), BLOCK_SIZE, "LTO")
}

pub fn autoloader(name: &str, slots: &[&str], faults: Option<FaultConfig>) -> StorageDevice {
    use libstord::engine::Device;

    let mut loader = VirtualAutoloader::new(name, BLOCK_SIZE, None);
    for slot in slots {
        loader.insert_volume(&volume(slot)).unwrap();
    }
    match faults {
        Some(faults) => StorageDevice::new(
            Box::new(SimulatedFaults::new(Box::new(loader), faults)),
            BLOCK_SIZE,
            "LTO",
        ),
        None => StorageDevice::new(Box::new(loader), BLOCK_SIZE, "LTO"),
    }
}

/// `count` records of `size` bytes each, over a few files and streams.
pub fn records(count: usize, size: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let data = (0..size).map(|b| ((b * 31 + i * 7) % 256) as u8).collect();
            Record::new(if i % 3 == 0 { 1 } else { 2 }, (i / 3) as i32 + 1, data)
        })
        .collect()
}
