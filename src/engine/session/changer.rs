// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::VecDeque,
    fmt::Debug,
    sync::{Arc, Mutex},
};

use crate::{engine::types::VolumeName, stord::StordResult};

/// Supplies volumes to write to, as an operator or an autochanger would.
pub trait MediaChanger: Debug + Send + Sync {
    /// A volume to mount next, other than any in `exclude`, or `None` if
    /// nothing is available yet. The caller polls until it gives up.
    fn next_volume(&self, exclude: &[VolumeName]) -> StordResult<Option<VolumeName>>;
}

/// A shared list of candidate volumes, in the order they are to be used.
/// Clones share the list, so an operator can add volumes while a session
/// waits for one.
#[derive(Clone, Debug, Default)]
pub struct VolumePool {
    volumes: Arc<Mutex<VecDeque<VolumeName>>>,
}

impl VolumePool {
    pub fn new<I>(volumes: I) -> VolumePool
    where
        I: IntoIterator<Item = VolumeName>,
    {
        VolumePool {
            volumes: Arc::new(Mutex::new(volumes.into_iter().collect())),
        }
    }

    /// Make another volume available.
    pub fn add(&self, volume: VolumeName) -> StordResult<()> {
        let mut volumes = self.volumes.lock()?;
        if !volumes.contains(&volume) {
            info!("volume \"{}\" added to the pool", volume);
            volumes.push_back(volume);
        }
        Ok(())
    }

    /// Take a volume out of use.
    pub fn remove(&self, volume: &VolumeName) -> StordResult<()> {
        self.volumes.lock()?.retain(|v| v != volume);
        Ok(())
    }

    pub fn volumes(&self) -> StordResult<Vec<VolumeName>> {
        Ok(self.volumes.lock()?.iter().cloned().collect())
    }
}

impl MediaChanger for VolumePool {
    fn next_volume(&self, exclude: &[VolumeName]) -> StordResult<Option<VolumeName>> {
        Ok(self
            .volumes
            .lock()?
            .iter()
            .find(|volume| !exclude.contains(volume))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_shared() {
        let a = VolumeName::new("A").unwrap();
        let b = VolumeName::new("B").unwrap();
        let pool = VolumePool::new(vec![a.clone()]);
        let operator = pool.clone();

        assert_eq!(pool.next_volume(&[]).unwrap(), Some(a.clone()));
        assert_eq!(pool.next_volume(&[a.clone()]).unwrap(), None);

        operator.add(b.clone()).unwrap();
        operator.add(b.clone()).unwrap();
        assert_eq!(pool.next_volume(&[a.clone()]).unwrap(), Some(b.clone()));
        assert_eq!(pool.volumes().unwrap(), vec![a.clone(), b]);

        operator.remove(&a).unwrap();
        assert_eq!(pool.volumes().unwrap().len(), 1);
    }
}
