//! Swappable provider handle
//!
//! A host application that refreshes its dataset keeps one
//! [`ProviderHandle`] and replaces the provider behind it. Readers take an
//! `Arc<Provider>` with [`ProviderHandle::current`]; a swap never tears a
//! match in flight because the retired provider stays alive until the last
//! reader lets go. [`ProviderHandle::drain`] waits for that and then
//! disposes the retired dataset.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use uamatch::{Dataset, Provider, ProviderHandle};
//!
//! let handle = ProviderHandle::new(Provider::new(Dataset::from("devices.dat").open()?));
//!
//! let result = handle.current().match_user_agent("Mozilla/5.0 (Linux; Android 14)")?;
//!
//! // Later, after downloading a new dataset
//! let retired = handle.swap(Provider::new(Dataset::from("devices-new.dat").open()?));
//! drop(result);
//! handle.drain(retired, Duration::from_secs(5)).ok();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::provider::Provider;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Owned, atomically swappable reference to the active [`Provider`]
pub struct ProviderHandle {
    current: ArcSwap<Provider>,
    generation: AtomicU64,
}

impl ProviderHandle {
    /// Create a handle; the first provider is generation 1
    pub fn new(provider: Provider) -> Self {
        Self {
            current: ArcSwap::from_pointee(provider),
            generation: AtomicU64::new(1),
        }
    }

    /// The active provider
    pub fn current(&self) -> Arc<Provider> {
        self.current.load_full()
    }

    /// Get the current generation counter
    ///
    /// Incremented on every swap.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Install `provider` and return the one it replaces
    ///
    /// New readers see the new provider immediately. The retired provider
    /// keeps serving anyone who already holds it.
    pub fn swap(&self, provider: Provider) -> Arc<Provider> {
        let retired = self.current.swap(Arc::new(provider));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            retired = %retired.dataset().name(),
            active = %self.current.load().dataset().name(),
            generation,
            "provider swapped"
        );
        retired
    }

    /// Wait until nothing else references `retired` or its dataset, then
    /// dispose the dataset
    ///
    /// Matches hold their dataset, so a caller keeping a match alive keeps
    /// the drain waiting. On timeout the provider is handed back untouched.
    pub fn drain(&self, retired: Arc<Provider>, timeout: Duration) -> Result<(), Arc<Provider>> {
        let deadline = Instant::now() + timeout;
        loop {
            if Arc::strong_count(&retired) == 1 && Arc::strong_count(retired.dataset()) == 1 {
                retired.dataset().dispose();
                debug!(dataset = %retired.dataset().name(), "retired provider drained");
                return Ok(());
            }
            if Instant::now() >= deadline {
                debug!(
                    dataset = %retired.dataset().name(),
                    providers = Arc::strong_count(&retired),
                    datasets = Arc::strong_count(retired.dataset()),
                    "drain timed out"
                );
                return Err(retired);
            }
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("current", &self.current.load_full())
            .field("generation", &self.generation())
            .finish()
    }
}
