//! Detection entry point
//!
//! A [`Provider`] owns a shared [`Dataset`], an optional cache of results
//! keyed by User-Agent, and detection statistics. It is `Send + Sync`; any
//! number of threads may match through one provider at once.
//!
//! # Examples
//!
//! ```
//! use uamatch::{Dataset, DatasetBuilder, MatchMethod, Provider, ValueType};
//!
//! let mut builder = DatasetBuilder::new("demo").min_user_agent_length(4);
//! let hardware = builder.add_component("HardwarePlatform", &["User-Agent"]);
//! let mobile = builder.add_property(hardware, "IsMobile", ValueType::Bool, Some("False"))?;
//! builder.add_profile(hardware, 1, &[(mobile, "False")])?;
//! builder.add_profile(hardware, 2, &[(mobile, "True")])?;
//! builder.set_default_profile(hardware, 1)?;
//! builder.add_signature("Phone OS", &["Phone"], &[2])?;
//!
//! let dataset = Dataset::from_bytes(builder.build()?)?;
//! let provider = Provider::builder(dataset).build();
//!
//! let result = provider.match_user_agent("Phone OS")?;
//! assert_eq!(result.method(), MatchMethod::Exact);
//! assert_eq!(result.values("IsMobile")?.to_bool(), Some(true));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::controller;
use crate::dataset::Dataset;
use crate::entities::Profile;
use crate::error::Result;
use crate::match_result::{Match, MatchResult};
use crate::match_state::MatchState;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::debug;
use uamatch_cache::{CacheStats, LruCache};
use uamatch_method::MatchMethod;

/// Default number of User-Agent results kept by a provider
pub const DEFAULT_USER_AGENT_CACHE_CAPACITY: usize = 10_000;

/// Provider configuration
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Results cached by User-Agent; 0 disables the cache
    ///
    /// Default: 10,000
    pub user_agent_cache_capacity: usize,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            user_agent_cache_capacity: DEFAULT_USER_AGENT_CACHE_CAPACITY,
        }
    }
}

/// Builder returned by [`Provider::builder`]
pub struct ProviderBuilder {
    dataset: Arc<Dataset>,
    options: ProviderOptions,
}

impl ProviderBuilder {
    /// Set the User-Agent result cache capacity
    pub fn user_agent_cache_capacity(mut self, capacity: usize) -> Self {
        self.options.user_agent_cache_capacity = capacity;
        self
    }

    /// Match every User-Agent afresh
    pub fn no_cache(mut self) -> Self {
        self.options.user_agent_cache_capacity = 0;
        self
    }

    /// Create the provider
    pub fn build(self) -> Provider {
        Provider::with_options(self.dataset, self.options)
    }
}

/// Detection counters, updated atomically by every thread using a provider
#[derive(Debug, Default)]
pub struct ProviderStats {
    /// Detections served, one per public match call
    pub detection_count: AtomicU64,
    /// Detections per [`MatchMethod`], indexed by [`MatchMethod::index`]
    pub method_counts: [AtomicU64; MatchMethod::COUNT],
    /// User-Agent results served from the cache
    pub cache_hits: AtomicU64,
    /// User-Agent results computed on a cache miss
    pub cache_misses: AtomicU64,
}

/// Point-in-time copy of [`ProviderStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStatsSnapshot {
    /// Detections served
    pub detection_count: u64,
    /// Detections per method
    pub method_counts: [u64; MatchMethod::COUNT],
    /// Cache hits
    pub cache_hits: u64,
    /// Cache misses
    pub cache_misses: u64,
}

impl ProviderStats {
    fn record(&self, method: MatchMethod) {
        self.detection_count.fetch_add(1, Ordering::Relaxed);
        self.method_counts[method.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of current statistics
    pub fn snapshot(&self) -> ProviderStatsSnapshot {
        ProviderStatsSnapshot {
            detection_count: self.detection_count.load(Ordering::Relaxed),
            method_counts: std::array::from_fn(|i| self.method_counts[i].load(Ordering::Relaxed)),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

impl ProviderStatsSnapshot {
    /// Detections resolved by `method`
    pub fn method_count(&self, method: MatchMethod) -> u64 {
        self.method_counts[method.index()]
    }

    /// Calculate cache hit rate (0.0 to 1.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

/// Matches User-Agents, header sets and device ids against one dataset
pub struct Provider {
    dataset: Arc<Dataset>,
    cache: Option<LruCache<String, MatchResult>>,
    stats: ProviderStats,
}

impl Provider {
    /// Provider with default options
    pub fn new(dataset: impl Into<Arc<Dataset>>) -> Self {
        Self::with_options(dataset.into(), ProviderOptions::default())
    }

    /// Start configuring a provider
    pub fn builder(dataset: impl Into<Arc<Dataset>>) -> ProviderBuilder {
        ProviderBuilder {
            dataset: dataset.into(),
            options: ProviderOptions::default(),
        }
    }

    /// Provider with explicit options
    pub fn with_options(dataset: Arc<Dataset>, options: ProviderOptions) -> Self {
        let capacity = options.user_agent_cache_capacity;
        debug!(dataset = %dataset.name(), cache_capacity = capacity, "provider created");
        Self {
            dataset,
            cache: (capacity > 0).then(|| LruCache::new(capacity)),
            stats: ProviderStats::default(),
        }
    }

    /// Dataset this provider matches against
    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// Snapshot of detection statistics
    pub fn stats(&self) -> ProviderStatsSnapshot {
        self.stats.snapshot()
    }

    /// User-Agent cache counters; `None` when caching is disabled
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(LruCache::stats)
    }

    /// Empty the User-Agent cache
    pub fn reset_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.reset();
            debug!(dataset = %self.dataset.name(), "user agent cache reset");
        }
    }

    /// A blank match for [`Provider::match_user_agent_into`]
    pub fn new_match(&self) -> Match {
        Match::new(Arc::clone(&self.dataset))
    }

    /// Result for one User-Agent, through the cache when enabled
    fn detect(&self, user_agent: &str) -> Result<Arc<MatchResult>> {
        let Some(cache) = &self.cache else {
            let mut state = MatchState::new();
            return controller::detect(&self.dataset, &mut state, user_agent).map(Arc::new);
        };
        let mut loaded = false;
        let result = cache.get_or_load(user_agent, |ua: &str| {
            loaded = true;
            let mut state = MatchState::new();
            controller::detect(&self.dataset, &mut state, ua)
        })?;
        let counter = if loaded {
            &self.stats.cache_misses
        } else {
            &self.stats.cache_hits
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Detect the device behind a User-Agent
    pub fn match_user_agent(&self, user_agent: &str) -> Result<Match> {
        self.dataset.check_disposed()?;
        let result = self.detect(user_agent)?;
        self.stats.record(result.method());
        Ok(Match::with_result(Arc::clone(&self.dataset), result))
    }

    /// Detect into a caller-owned match, reusing its working buffers when
    /// the cache is disabled
    pub fn match_user_agent_into(&self, user_agent: &str, target: &mut Match) -> Result<()> {
        self.dataset.check_disposed()?;
        let result = if self.cache.is_some() {
            self.detect(user_agent)?
        } else {
            Arc::new(controller::detect(&self.dataset, target.state_mut(), user_agent)?)
        };
        self.stats.record(result.method());
        target.set_result(Arc::clone(&self.dataset), result);
        Ok(())
    }

    /// Detect from a set of HTTP headers
    ///
    /// Header names are compared case-insensitively against the headers the
    /// dataset knows. With several relevant headers each one is matched on
    /// its own thread, and every component takes its profile from the first
    /// of its preferred headers that resolved a signature. The combined
    /// result reports the worst method among the contributing headers and
    /// has no single signature or User-Agent.
    pub fn match_headers<'a, I>(&self, headers: I) -> Result<Match>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.dataset.check_disposed()?;
        let supplied: Vec<(&str, &str)> = headers.into_iter().collect();
        let relevant: Vec<(&str, &str)> = self
            .dataset
            .http_headers()
            .iter()
            .filter_map(|name| {
                supplied
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|&(_, value)| (name.as_str(), value))
            })
            .collect();

        match relevant.as_slice() {
            [] => {
                let start = Instant::now();
                let result = MatchResult {
                    profiles: self.dataset.default_profiles()?,
                    elapsed: start.elapsed(),
                    ..MatchResult::default()
                };
                self.stats.record(result.method());
                Ok(Match::with_result(Arc::clone(&self.dataset), Arc::new(result)))
            }
            [(_, value)] => self.match_user_agent(value),
            _ => {
                let results = self.detect_each(&relevant)?;
                let merged = self.merge_headers(&relevant, &results)?;
                self.stats.record(merged.method());
                Ok(Match::with_result(Arc::clone(&self.dataset), Arc::new(merged)))
            }
        }
    }

    /// Match every header value in parallel; any failure fails the lot
    fn detect_each(&self, relevant: &[(&str, &str)]) -> Result<Vec<Arc<MatchResult>>> {
        thread::scope(|s| {
            let handles: Vec<_> = relevant
                .iter()
                .map(|&(_, value)| s.spawn(move || self.detect(value)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload)))
                .collect()
        })
    }

    fn merge_headers(&self, relevant: &[(&str, &str)], results: &[Arc<MatchResult>]) -> Result<MatchResult> {
        let mut merged = MatchResult::default();
        let mut contributing: Vec<usize> = Vec::new();

        for component in self.dataset.components() {
            let chosen = component.http_headers().iter().find_map(|header| {
                relevant
                    .iter()
                    .position(|(name, _)| name.eq_ignore_ascii_case(header))
                    .filter(|&i| results[i].signature().is_some())
            });
            let from_header = chosen.and_then(|i| {
                results[i]
                    .profiles()
                    .iter()
                    .find(|p| p.component() == component.index())
                    .map(|p| (i, Arc::clone(p)))
            });
            match from_header {
                Some((i, profile)) => {
                    if !contributing.contains(&i) {
                        contributing.push(i);
                    }
                    merged.profiles.push(profile);
                }
                None => merged
                    .profiles
                    .push(self.dataset.profile(component.default_profile())?),
            }
        }

        for &i in &contributing {
            merged.accumulate(&results[i]);
        }
        Ok(merged)
    }

    /// Rebuild a match from [`Match::device_id_as_bytes`] output
    ///
    /// A trailing partial id is ignored.
    pub fn match_for_device_id_bytes(&self, device_id: &[u8]) -> Result<Match> {
        let ids: Vec<u32> = device_id
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        self.match_for_device_id_ids(&ids)
    }

    /// Rebuild a match from a `-` separated device id
    ///
    /// Parts that are not numbers are skipped.
    pub fn match_for_device_id_str(&self, device_id: &str) -> Result<Match> {
        let ids: Vec<u32> = device_id
            .split('-')
            .filter_map(|part| part.trim().parse().ok())
            .collect();
        self.match_for_device_id_ids(&ids)
    }

    /// Rebuild a match from explicit profile ids
    ///
    /// Unknown ids are skipped; the first id for a component wins.
    pub fn match_for_device_id_ids(&self, profile_ids: &[u32]) -> Result<Match> {
        self.dataset.check_disposed()?;
        let start = Instant::now();
        let mut profiles: Vec<Arc<Profile>> = Vec::with_capacity(profile_ids.len());
        for &id in profile_ids {
            if let Some(profile) = self.dataset.find_profile(id)? {
                if !profiles.iter().any(|p| p.component() == profile.component()) {
                    profiles.push(profile);
                }
            }
        }
        profiles.sort_by_key(|p| p.component());

        let result = MatchResult {
            profiles,
            elapsed: start.elapsed(),
            ..MatchResult::default()
        };
        self.stats.record(result.method());
        Ok(Match::with_result(Arc::clone(&self.dataset), Arc::new(result)))
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("dataset", &self.dataset.name())
            .field("cache_capacity", &self.cache.as_ref().map(LruCache::capacity))
            .finish()
    }
}
