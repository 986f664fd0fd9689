//! Process-wide registry of live managers
//!
//! Managers are addressed by an integer handle. Handles are never reused,
//! so a handle that was released reports `HandleNotFound` instead of
//! reaching some later manager.
//!
//! Creating a manager can block (a joiner polls until rank 0 has created the
//! segment), so the registry lock is not held while it runs: the `(name,
//! rank)` pair is reserved first and the manager installed afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;

use crate::ccl::ShmManager;
use crate::error::{ForgeResult, ShmForgeError};

static REGISTRY: Lazy<Mutex<ManagerRegistry>> = Lazy::new(|| Mutex::new(ManagerRegistry::new()));

/// Handle-indexed table of managers
#[derive(Debug)]
pub struct ManagerRegistry {
    next_handle: i64,
    managers: HashMap<i64, Arc<ShmManager>>,
    /// `(name, rank)` of every reserved or live handle
    by_name: HashMap<(String, usize), i64>,
}

impl Default for ManagerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self {
            next_handle: 1,
            managers: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Claim a handle for `(name, rank)` before the manager exists
    ///
    /// # Errors
    /// `InvalidArgument` if this process already holds that rank of `name`.
    pub fn reserve(&mut self, name: &str, rank: usize) -> ForgeResult<i64> {
        let key = (name.to_string(), rank);
        if let Some(existing) = self.by_name.get(&key) {
            return Err(ShmForgeError::InvalidArgument(format!(
                "rank {} of {:?} is already initialized in this process (handle {})",
                rank, name, existing
            )));
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.by_name.insert(key, handle);
        Ok(handle)
    }

    /// Install the manager for a reserved handle
    pub fn fulfill(&mut self, handle: i64, manager: ShmManager) -> ForgeResult<Arc<ShmManager>> {
        let key = (manager.name().to_string(), manager.rank());
        if self.by_name.get(&key) != Some(&handle) {
            return Err(ShmForgeError::InternalError(format!(
                "handle {} was not reserved for rank {} of {:?}",
                handle, key.1, key.0
            )));
        }
        let manager = Arc::new(manager);
        self.managers.insert(handle, Arc::clone(&manager));
        Ok(manager)
    }

    /// Drop a reservation whose manager could not be created
    pub fn cancel(&mut self, handle: i64) {
        self.by_name.retain(|_, h| *h != handle);
    }

    pub fn get(&self, handle: i64) -> ForgeResult<Arc<ShmManager>> {
        self.managers
            .get(&handle)
            .cloned()
            .ok_or(ShmForgeError::HandleNotFound(handle))
    }

    /// Handle of the live manager for `(name, rank)`, if any
    pub fn lookup(&self, name: &str, rank: usize) -> Option<i64> {
        let handle = *self.by_name.get(&(name.to_string(), rank))?;
        self.managers.contains_key(&handle).then_some(handle)
    }

    /// Remove a manager. The segment is detached once in-flight calls holding
    /// the manager finish.
    pub fn remove(&mut self, handle: i64) -> ForgeResult<Arc<ShmManager>> {
        let manager = self
            .managers
            .remove(&handle)
            .ok_or(ShmForgeError::HandleNotFound(handle))?;
        self.by_name.retain(|_, h| *h != handle);
        Ok(manager)
    }

    /// Remove every manager, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.managers.len();
        self.managers.clear();
        self.by_name.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Live handles in ascending order
    pub fn handles(&self) -> Vec<i64> {
        let mut handles: Vec<i64> = self.managers.keys().copied().collect();
        handles.sort_unstable();
        handles
    }
}

/// Create a manager and register it in the process-wide registry
pub fn register_with<F>(name: &str, rank: usize, create: F) -> ForgeResult<i64>
where
    F: FnOnce() -> ForgeResult<ShmManager>,
{
    let handle = REGISTRY.lock()?.reserve(name, rank)?;
    match create() {
        Ok(manager) => {
            let mut registry = REGISTRY.lock()?;
            match registry.fulfill(handle, manager) {
                Ok(_) => {
                    tracing::debug!("Registered rank {} of {:?} as handle {}", rank, name, handle);
                    Ok(handle)
                }
                Err(e) => {
                    registry.cancel(handle);
                    Err(e)
                }
            }
        }
        Err(e) => {
            cancel_reservation(&REGISTRY, handle);
            Err(e)
        }
    }
}

/// Drop a reservation whose manager could not be created
///
/// Runs even on a poisoned lock so the creation error reaches the caller
/// and the `(name, rank)` pair can be initialized again.
fn cancel_reservation(registry: &Mutex<ManagerRegistry>, handle: i64) {
    registry
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .cancel(handle);
}

/// Look up a live manager by handle
pub fn get(handle: i64) -> ForgeResult<Arc<ShmManager>> {
    REGISTRY.lock()?.get(handle)
}

/// Handle of the live manager for rank `rank` of `name`
pub fn lookup(name: &str, rank: usize) -> ForgeResult<Option<i64>> {
    Ok(REGISTRY.lock()?.lookup(name, rank))
}

/// Release one manager
pub fn release(handle: i64) -> ForgeResult<()> {
    let manager = REGISTRY.lock()?.remove(handle)?;
    tracing::debug!(
        "Released handle {} (rank {} of {:?})",
        handle,
        manager.rank(),
        manager.name()
    );
    Ok(())
}

/// Release every manager of this process
pub fn release_all() -> ForgeResult<usize> {
    let count = REGISTRY.lock()?.clear();
    if count > 0 {
        tracing::debug!("Released {} shared-memory managers", count);
    }
    Ok(count)
}
