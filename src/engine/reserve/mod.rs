// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

mod table;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, TryLockError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use serde_derive::Serialize;

pub use self::table::{Holder, ReservationTable};

use crate::{
    engine::{
        device::{Capabilities, DeviceKind, DeviceState, StorageDevice},
        types::{AccessMode, DevicePosition, SessionId, VolumeName},
    },
    stord::{DaemonContext, ErrorEnum, StordError, StordResult},
};

/// Longest a waiting reservation sleeps before looking for expired
/// leases again.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// How often a token waiting for a busy device retries the lock.
const LOCK_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct DeviceSlot {
    kind: DeviceKind,
    media_type: String,
    capabilities: Capabilities,
    device: Mutex<StorageDevice>,
    /// Set when the device's holder was reclaimed; the next lock recovers
    /// the device.
    abandoned: AtomicBool,
}

#[derive(Debug)]
struct PoolInner {
    devices: IndexMap<String, DeviceSlot>,
    table: Mutex<ReservationTable>,
    released: Condvar,
    watchdog: Duration,
}

impl PoolInner {
    fn slot(&self, name: &str) -> StordResult<&DeviceSlot> {
        self.devices.get(name).ok_or_else(|| {
            StordError::Engine(ErrorEnum::NotFound, format!("no device named \"{name}\""))
        })
    }

    fn reap(&self, table: &mut ReservationTable) -> usize {
        let expired = table.expire(self.watchdog, Instant::now());
        for (device, holder) in &expired {
            warn!(
                "reclaiming {} reservation of \"{}\" from job \"{}\": no heartbeat for {}s",
                holder.mode,
                device,
                holder.job,
                self.watchdog.as_secs()
            );
            if let Some(slot) = self.devices.get(device) {
                slot.abandoned.store(true, Ordering::SeqCst);
            }
        }
        if !expired.is_empty() {
            self.released.notify_all();
        }
        expired.len()
    }
}

/// Reservation state of one holder, for status reports.
#[derive(Clone, Debug, Serialize)]
pub struct ReservationStatus {
    pub job: String,
    pub mode: AccessMode,
    pub held_secs: u64,
    pub idle_secs: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub kind: DeviceKind,
    pub media_type: String,
    /// `None` while the device is busy with I/O.
    pub state: Option<DeviceState>,
    pub volume: Option<VolumeName>,
    pub position: Option<DevicePosition>,
    pub owner: Option<SessionId>,
    pub needs_recovery: bool,
    pub reservations: Vec<ReservationStatus>,
}

/// The configured devices and who has them reserved.
#[derive(Clone, Debug)]
pub struct DevicePool {
    inner: Arc<PoolInner>,
}

impl DevicePool {
    /// Reservations not refreshed within `watchdog` are reclaimed.
    pub fn new(devices: Vec<StorageDevice>, watchdog: Duration) -> StordResult<DevicePool> {
        let mut slots = IndexMap::new();
        for device in devices {
            let name = device.name().to_owned();
            if slots.contains_key(&name) {
                return Err(StordError::Engine(
                    ErrorEnum::Invalid,
                    format!("device \"{name}\" configured twice"),
                ));
            }
            let slot = DeviceSlot {
                kind: device.device_ref().kind(),
                media_type: device.media_type().to_owned(),
                capabilities: device.device_ref().capabilities(),
                device: Mutex::new(device),
                abandoned: AtomicBool::new(false),
            };
            slots.insert(name, slot);
        }
        Ok(DevicePool {
            inner: Arc::new(PoolInner {
                devices: slots,
                table: Mutex::new(ReservationTable::default()),
                released: Condvar::new(),
                watchdog,
            }),
        })
    }

    pub fn from_config(ctx: &DaemonContext) -> StordResult<DevicePool> {
        let devices = ctx
            .config()
            .devices
            .iter()
            .map(|config| StorageDevice::from_config(config, ctx.block_size()))
            .collect::<StordResult<Vec<_>>>()?;
        DevicePool::new(devices, ctx.config().watchdog_timeout())
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.devices.keys().cloned().collect()
    }

    /// Devices `name_or_class` refers to: the device of that name, or
    /// every device of that media type.
    fn candidates(&self, name_or_class: &str) -> StordResult<Vec<&str>> {
        if let Some((name, _)) = self.inner.devices.get_key_value(name_or_class) {
            return Ok(vec![name.as_str()]);
        }
        let matching: Vec<&str> = self
            .inner
            .devices
            .iter()
            .filter(|(_, slot)| slot.media_type == name_or_class)
            .map(|(name, _)| name.as_str())
            .collect();
        if matching.is_empty() {
            return Err(StordError::Engine(
                ErrorEnum::NotFound,
                format!("no device or media type named \"{name_or_class}\""),
            ));
        }
        Ok(matching)
    }

    /// Reserve a device by name or media type, waiting up to `timeout`
    /// for one to become free.
    pub fn reserve(
        &self,
        name_or_class: &str,
        mode: AccessMode,
        job: &str,
        timeout: Duration,
    ) -> StordResult<ReservationToken> {
        let candidates = self.candidates(name_or_class)?;
        let deadline = Instant::now() + timeout;
        let mut table = self.inner.table.lock()?;
        let mut waiting = false;
        loop {
            self.inner.reap(&mut table);
            for name in &candidates {
                let slot = self.inner.slot(name)?;
                if table.can_grant(name, mode, slot.capabilities.concurrent_read) {
                    let token = table.grant(name, mode, job, Instant::now());
                    info!("job \"{}\" reserved \"{}\" for {}", job, name, mode);
                    return Ok(ReservationToken {
                        pool: Arc::clone(&self.inner),
                        device: (*name).to_owned(),
                        token,
                        mode,
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StordError::Engine(
                    ErrorEnum::DeviceBusy,
                    format!("no device for \"{name_or_class}\" became free for {mode}"),
                ));
            }
            if !waiting {
                debug!("job \"{}\" waiting for \"{}\"", job, name_or_class);
                waiting = true;
            }
            let wait = (deadline - now).min(REAP_INTERVAL);
            table = self.inner.released.wait_timeout(table, wait)?.0;
        }
    }

    /// Reserve without waiting.
    pub fn try_reserve(
        &self,
        name_or_class: &str,
        mode: AccessMode,
        job: &str,
    ) -> StordResult<ReservationToken> {
        self.reserve(name_or_class, mode, job, Duration::ZERO)
    }

    /// Reclaim expired reservations now. Returns how many were reclaimed.
    pub fn reap(&self) -> StordResult<usize> {
        let mut table = self.inner.table.lock()?;
        Ok(self.inner.reap(&mut table))
    }

    /// Reap expired reservations every `interval` until the returned
    /// handle is dropped.
    pub fn start_watchdog(&self, interval: Duration) -> Watchdog {
        let stop = Arc::new(AtomicBool::new(false));
        let pool = self.clone();
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("stord-watchdog".into())
            .spawn(move || {
                while !flag.load(Ordering::SeqCst) {
                    if let Err(err) = pool.reap() {
                        error!("reservation watchdog: {}", err);
                    }
                    thread::park_timeout(interval);
                }
            });
        match handle {
            Ok(handle) => Watchdog {
                stop,
                handle: Some(handle),
            },
            Err(err) => {
                error!("failed to start reservation watchdog: {}", err);
                Watchdog { stop, handle: None }
            }
        }
    }

    pub fn status(&self) -> StordResult<Vec<DeviceStatus>> {
        let now = Instant::now();
        let reservations: Vec<Vec<ReservationStatus>> = {
            let table = self.inner.table.lock()?;
            self.inner
                .devices
                .keys()
                .map(|name| {
                    table
                        .holders(name)
                        .iter()
                        .map(|h| ReservationStatus {
                            job: h.job.clone(),
                            mode: h.mode,
                            held_secs: now.saturating_duration_since(h.granted).as_secs(),
                            idle_secs: now.saturating_duration_since(h.heartbeat).as_secs(),
                        })
                        .collect()
                })
                .collect()
        };

        Ok(self
            .inner
            .devices
            .iter()
            .zip(reservations)
            .map(|((name, slot), reservations)| {
                let mut status = DeviceStatus {
                    name: name.clone(),
                    kind: slot.kind,
                    media_type: slot.media_type.clone(),
                    state: None,
                    volume: None,
                    position: None,
                    owner: None,
                    needs_recovery: slot.abandoned.load(Ordering::SeqCst),
                    reservations,
                };
                if let Ok(dev) = slot.device.try_lock() {
                    status.state = Some(dev.device_ref().state());
                    status.volume = dev.device_ref().volume().cloned();
                    status.position = Some(dev.device_ref().tell());
                    status.owner = dev.owner();
                    status.needs_recovery |= dev.needs_recovery();
                }
                status
            })
            .collect())
    }

    /// Unload every device, waiting for any in use.
    pub fn shutdown(&self) -> StordResult<()> {
        for (name, slot) in &self.inner.devices {
            let mut dev = slot
                .device
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Err(err) = dev.shutdown() {
                warn!("shutdown of device \"{}\" failed: {}", name, err);
            }
        }
        Ok(())
    }
}

/// Handle of the watchdog thread; stops it when dropped.
pub struct Watchdog {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("reservation watchdog panicked");
            }
        }
    }
}

/// A granted reservation. Released when dropped.
pub struct ReservationToken {
    pool: Arc<PoolInner>,
    device: String,
    token: u64,
    mode: AccessMode,
}

impl fmt::Debug for ReservationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationToken")
            .field("device", &self.device)
            .field("token", &self.token)
            .field("mode", &self.mode)
            .finish()
    }
}

impl ReservationToken {
    pub fn device_name(&self) -> &str {
        &self.device
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn capabilities(&self) -> StordResult<Capabilities> {
        Ok(self.pool.slot(&self.device)?.capabilities)
    }

    /// Keep the reservation from being reclaimed. Fails once it has been.
    pub fn heartbeat(&self) -> StordResult<()> {
        let mut table = self.pool.table.lock()?;
        if table.heartbeat(&self.device, self.token, Instant::now()) {
            Ok(())
        } else {
            Err(StordError::Engine(
                ErrorEnum::TimedOut,
                format!("reservation of \"{}\" was reclaimed", self.device),
            ))
        }
    }

    /// Exclusive access to the device for I/O. A device left in an
    /// unknown state by a reclaimed or panicked holder is recovered first.
    ///
    /// Shared readers of a disk hold the lock for a whole session; the
    /// others wait here and keep their leases alive while they do.
    pub fn lock_device(&self) -> StordResult<MutexGuard<'_, StorageDevice>> {
        let slot = self.pool.slot(&self.device)?;
        let mut waiting = false;
        let mut dev = loop {
            self.heartbeat()?;
            match slot.device.try_lock() {
                Ok(dev) => break dev,
                Err(TryLockError::Poisoned(poisoned)) => {
                    let mut dev = poisoned.into_inner();
                    dev.mark_for_recovery();
                    slot.device.clear_poison();
                    break dev;
                }
                Err(TryLockError::WouldBlock) => {
                    if !waiting {
                        debug!("waiting for \"{}\" to be free for I/O", self.device);
                        waiting = true;
                    }
                    thread::sleep(LOCK_POLL);
                }
            }
        };
        if slot.abandoned.swap(false, Ordering::SeqCst) {
            dev.mark_for_recovery();
        }
        dev.recover()?;
        Ok(dev)
    }
}

impl Drop for ReservationToken {
    fn drop(&mut self) {
        let mut table = self
            .pool
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if table.release(&self.device, self.token) {
            debug!("released {} reservation of \"{}\"", self.mode, self.device);
        }
        self.pool.released.notify_all();
    }
}
