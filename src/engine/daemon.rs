// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde_derive::Serialize;

use crate::{
    engine::{
        device::CancelToken,
        record::Record,
        reserve::{DevicePool, DeviceStatus, ReservationToken, Watchdog},
        session::{
            MemoryCatalog, ReadResult, Selection, SessionManager, SessionResult, VolumeCatalog,
            VolumeLabel, VolumePool, VolumeRecord, WriteRequest,
        },
        types::{AccessMode, DevicePosition, VolumeName},
    },
    stord::{DaemonConfig, DaemonContext, StatsSnapshot, StordResult, VERSION},
};

const CATALOG_FILE: &str = "catalog.json";

#[derive(Debug, Serialize)]
pub struct DaemonStatus {
    pub version: &'static str,
    pub stats: StatsSnapshot,
    pub devices: Vec<DeviceStatus>,
    pub volumes: Vec<VolumeRecord>,
}

/// One storage daemon instance: its devices, catalog and sessions.
#[derive(Debug)]
pub struct StorageDaemon {
    manager: SessionManager,
    catalog: Arc<MemoryCatalog>,
    changer: VolumePool,
    _watchdog: Watchdog,
}

impl StorageDaemon {
    /// Set up the devices of `config` and load the catalog from the
    /// working directory.
    pub fn new(config: DaemonConfig) -> StordResult<StorageDaemon> {
        let ctx = Arc::new(DaemonContext::new(config)?);
        let pool = DevicePool::from_config(&ctx)?;
        let catalog = Arc::new(MemoryCatalog::load(
            &ctx.working_directory().join(CATALOG_FILE),
        )?);

        let mut volumes: Vec<VolumeName> = catalog
            .volumes()?
            .into_iter()
            .filter(|record| record.status.is_writable())
            .map(|record| record.volume)
            .collect();
        for device in pool.status()? {
            volumes.extend(device.volume);
        }
        let changer = VolumePool::new(volumes);
        info!(
            "storage daemon {} started with devices {:?}",
            VERSION,
            pool.names()
        );
        Ok(StorageDaemon::from_parts(ctx, pool, catalog, changer))
    }

    pub fn from_parts(
        ctx: Arc<DaemonContext>,
        pool: DevicePool,
        catalog: Arc<MemoryCatalog>,
        changer: VolumePool,
    ) -> StorageDaemon {
        match catalog.last_session_id() {
            Ok(Some(last)) => ctx.skip_session_ids(last),
            Ok(None) => {}
            Err(err) => warn!("failed to read session ids from the catalog: {}", err),
        }
        let interval = (ctx.config().watchdog_timeout() / 4).max(Duration::from_millis(10));
        let watchdog = pool.start_watchdog(interval);
        let manager = SessionManager::new(
            ctx,
            pool,
            Arc::clone(&catalog) as Arc<dyn VolumeCatalog>,
            Arc::new(changer.clone()),
        );
        StorageDaemon {
            manager,
            catalog,
            changer,
            _watchdog: watchdog,
        }
    }

    pub fn context(&self) -> &DaemonContext {
        self.manager.context()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.manager
    }

    pub fn catalog(&self) -> &MemoryCatalog {
        &self.catalog
    }

    /// Volumes offered to sessions that need one.
    pub fn changer(&self) -> &VolumePool {
        &self.changer
    }

    fn catalog_path(&self) -> PathBuf {
        self.context().working_directory().join(CATALOG_FILE)
    }

    pub fn reserve_device(
        &self,
        name_or_class: &str,
        mode: AccessMode,
        job: &str,
    ) -> StordResult<ReservationToken> {
        self.manager.pool().reserve(
            name_or_class,
            mode,
            job,
            self.context().config().reserve_timeout(),
        )
    }

    pub fn write_session<I>(
        &self,
        request: &WriteRequest,
        records: I,
        cancel: &CancelToken,
    ) -> StordResult<SessionResult>
    where
        I: IntoIterator<Item = Record>,
    {
        let result = self.manager.write_session(request, records, cancel);
        if let Err(err) = self.save_catalog() {
            if result.is_ok() {
                return Err(err);
            }
            warn!("failed to save catalog: {}", err);
        }
        result
    }

    pub fn read_session<F>(
        &self,
        device: &str,
        volume: &VolumeName,
        start: DevicePosition,
        cancel: &CancelToken,
        callback: F,
    ) -> StordResult<ReadResult>
    where
        F: FnMut(Record) -> StordResult<()>,
    {
        self.manager
            .read_session(device, volume, start, cancel, callback)
    }

    /// Restore part of a session; see [`SessionManager::read_selected`].
    pub fn read_selected<F>(
        &self,
        device: &str,
        volume: &VolumeName,
        start: DevicePosition,
        selection: &Selection,
        cancel: &CancelToken,
        callback: F,
    ) -> StordResult<ReadResult>
    where
        F: FnMut(Record) -> StordResult<()>,
    {
        self.manager
            .read_selected(device, volume, start, selection, cancel, callback)
    }

    /// Label a blank volume and offer it to future sessions.
    pub fn label_volume(
        &self,
        device: &str,
        volume: &VolumeName,
        cancel: &CancelToken,
    ) -> StordResult<VolumeLabel> {
        let label = self.manager.label_volume(device, volume, cancel)?;
        self.changer.add(volume.clone())?;
        self.save_catalog()?;
        Ok(label)
    }

    pub fn status(&self) -> StordResult<DaemonStatus> {
        Ok(DaemonStatus {
            version: VERSION,
            stats: self.context().snapshot(),
            devices: self.manager.pool().status()?,
            volumes: self.catalog.volumes()?,
        })
    }

    pub fn save_catalog(&self) -> StordResult<()> {
        self.catalog.save(&self.catalog_path())
    }

    /// Unload all devices, waiting for sessions using them, and save the
    /// catalog.
    pub fn shutdown(self) -> StordResult<()> {
        info!("storage daemon shutting down");
        self.manager.pool().shutdown()?;
        self.save_catalog()
    }
}
