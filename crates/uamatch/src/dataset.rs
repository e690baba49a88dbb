//! Device detection dataset
//!
//! A [`Dataset`] owns the entities of one dataset file and the lookups the
//! matcher needs: root nodes by character position, signatures by node
//! offsets, profiles by id. Two loading strategies are supported:
//!
//! - [`LoadMode::Memory`]: the file is memory-mapped (or bytes are taken as
//!   given) and every entity is decoded up front. Lookups are array indexing.
//! - [`LoadMode::Stream`]: only metadata is decoded up front. Strings, values,
//!   profiles, signatures and nodes are read on demand through a bounded pool
//!   of readers and kept in per-kind LRU caches.
//!
//! Components, properties, the root node catalog, the ranked signature
//! indexes and the profile id index are always resident.
//!
//! # Example
//!
//! ```no_run
//! use uamatch::{Dataset, LoadMode};
//!
//! // Everything in memory
//! let dataset = Dataset::from("devices.dat").open()?;
//!
//! // Lazily loaded, with small caches
//! let dataset = Dataset::from("devices.dat")
//!     .mode(LoadMode::Stream)
//!     .cache_capacity(5_000)
//!     .max_readers(4)
//!     .open()?;
//! # Ok::<(), uamatch::UamatchError>(())
//! ```

use crate::entities::{AsciiString, Component, Decode, Node, Profile, Property, Signature, Value};
use crate::error::{Result, UamatchError};
use crate::pool::{DataSource, ReaderPool};
use crate::search::{binary_search, compare_offsets};
use memmap2::Mmap;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use uamatch_cache::{CacheStats, LruCache};
use uamatch_format::{
    read_records, read_u32s, record_range, DatasetHeader, EntityKind, FormatError, ProfileOffset,
    SectionHeader, NONE,
};

/// Default per-kind entity cache size for stream-backed datasets
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// How entities are loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    /// Decode every entity when the dataset is opened
    #[default]
    Memory,
    /// Decode entities on demand through pooled readers and LRU caches
    Stream,
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadMode::Memory => f.write_str("memory"),
            LoadMode::Stream => f.write_str("stream"),
        }
    }
}

/// Options for opening a dataset
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    /// Path to the dataset file (ignored when `bytes` is set)
    pub path: PathBuf,

    /// Optional in-memory bytes (for from_bytes builder)
    pub bytes: Option<Vec<u8>>,

    /// Loading strategy
    pub mode: LoadMode,

    /// Entries per entity cache in stream mode
    pub cache_capacity: usize,

    /// Readers the stream pool may open concurrently
    pub max_readers: usize,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            bytes: None,
            mode: LoadMode::Memory,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_readers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Builder for opening datasets with custom configuration
///
/// Created via [`Dataset::from`] or [`Dataset::from_bytes_builder`].
pub struct DatasetOpener {
    options: DatasetOptions,
}

impl DatasetOpener {
    fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            options: DatasetOptions {
                path: path.into(),
                ..Default::default()
            },
        }
    }

    /// Create an opener over dataset bytes
    pub fn from_bytes_builder(bytes: Vec<u8>) -> DatasetOpener {
        DatasetOpener {
            options: DatasetOptions {
                bytes: Some(bytes),
                ..Default::default()
            },
        }
    }

    /// Select the loading strategy
    ///
    /// Default: [`LoadMode::Memory`]
    pub fn mode(mut self, mode: LoadMode) -> Self {
        self.options.mode = mode;
        self
    }

    /// Set the per-kind entity cache capacity used in stream mode
    ///
    /// Default: 10,000 entries per kind
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.options.cache_capacity = capacity;
        self
    }

    /// Set how many readers the stream pool may open
    ///
    /// Default: available parallelism
    pub fn max_readers(mut self, max_readers: usize) -> Self {
        self.options.max_readers = max_readers;
        self
    }

    /// Open the dataset with configured options
    pub fn open(self) -> Result<Dataset> {
        Dataset::open_with_options(self.options)
    }
}

/// Entity caches and reader pool of a stream-backed dataset
pub(crate) struct StreamStore {
    pool: ReaderPool,
    strings: LruCache<u32, AsciiString>,
    values: LruCache<u32, Value>,
    profiles: LruCache<u32, Profile>,
    signatures: LruCache<u32, Signature>,
    nodes: LruCache<u32, Node>,
}

/// Fully decoded entities of a memory-resident dataset
pub(crate) struct MemoryStore {
    strings: Vec<Arc<AsciiString>>,
    values: Vec<Arc<Value>>,
    profiles: Vec<Arc<Profile>>,
    signatures: Vec<Arc<Signature>>,
    nodes: Vec<Arc<Node>>,
}

enum EntityStore {
    Memory(MemoryStore),
    Stream(StreamStore),
}

/// Entities fetched by index through either store
pub(crate) trait Entity: Decode {
    fn in_memory(store: &MemoryStore) -> &[Arc<Self>];
    fn in_cache(store: &StreamStore) -> &LruCache<u32, Self>;
}

macro_rules! impl_entity {
    ($ty:ty, $field:ident) => {
        impl Entity for $ty {
            fn in_memory(store: &MemoryStore) -> &[Arc<Self>] {
                &store.$field
            }

            fn in_cache(store: &StreamStore) -> &LruCache<u32, Self> {
                &store.$field
            }
        }
    };
}

impl_entity!(AsciiString, strings);
impl_entity!(Value, values);
impl_entity!(Profile, profiles);
impl_entity!(Signature, signatures);
impl_entity!(Node, nodes);

/// Raw record access while a dataset is being opened
enum Source<'a> {
    Slice(&'a [u8]),
    Pool(&'a ReaderPool),
}

impl Source<'_> {
    fn read_at(&self, offset: u64, len: usize) -> Result<Cow<'_, [u8]>> {
        match self {
            Source::Slice(data) => {
                let start = offset as usize;
                data.get(start..start.saturating_add(len))
                    .map(Cow::Borrowed)
                    .ok_or_else(|| {
                        FormatError::OutOfBounds(format!(
                            "read of {} bytes at {} beyond buffer of {} bytes",
                            len,
                            offset,
                            data.len()
                        ))
                        .into()
                    })
            }
            Source::Pool(pool) => Ok(Cow::Owned(pool.read_at(offset, len)?)),
        }
    }

    fn record(&self, section: SectionHeader, kind: EntityKind, index: u32) -> Result<Cow<'_, [u8]>> {
        match self {
            Source::Slice(data) => {
                let range = record_range(data, section, index, kind)?;
                Ok(Cow::Borrowed(&data[range]))
            }
            Source::Pool(pool) => Ok(Cow::Owned(pool.read_record(section, kind, index)?)),
        }
    }

    fn u32_array(&self, section: SectionHeader, what: &str) -> Result<Vec<u32>> {
        let bytes = self.read_at(u64::from(section.offset), section.count as usize * 4)?;
        Ok(read_u32s(&bytes, section.count as usize, what)?.0)
    }

    fn decode<T: Decode>(
        &self,
        header: &DatasetHeader,
        index: u32,
        strings: &mut dyn FnMut(u32) -> Result<Arc<AsciiString>>,
    ) -> Result<T> {
        let bytes = self.record(header.section(T::KIND), T::KIND, index)?;
        T::decode(index, &bytes, strings)
    }

    fn string(&self, header: &DatasetHeader, index: u32) -> Result<Arc<AsciiString>> {
        let mut none = |i: u32| -> Result<Arc<AsciiString>> {
            Err(FormatError::Corrupt(format!("string {} refers to a string", i)).into())
        };
        self.decode::<AsciiString>(header, index, &mut none).map(Arc::new)
    }

    fn decode_all<T: Decode>(
        &self,
        header: &DatasetHeader,
        strings: &[Arc<AsciiString>],
    ) -> Result<Vec<Arc<T>>> {
        let mut lookup = |i: u32| -> Result<Arc<AsciiString>> {
            strings.get(i as usize).cloned().ok_or_else(|| {
                FormatError::OutOfBounds(format!("string index {} (count {})", i, strings.len())).into()
            })
        };
        (0..header.section(T::KIND).count)
            .map(|i| self.decode::<T>(header, i, &mut lookup).map(Arc::new))
            .collect()
    }
}

/// Resident metadata shared by both strategies
struct Metadata {
    name: String,
    components: Vec<Arc<Component>>,
    properties: Vec<Arc<Property>>,
    root_nodes: Vec<u32>,
    ranked_signature_indexes: Vec<u32>,
    profile_offsets: Vec<ProfileOffset>,
}

impl Metadata {
    fn load(source: &Source<'_>, header: &DatasetHeader) -> Result<Self> {
        let mut strings = |i| source.string(header, i);
        let name = if header.name == NONE {
            String::new()
        } else {
            strings(header.name)?.as_str().to_string()
        };
        let components = (0..header.components.count)
            .map(|i| source.decode::<Component>(header, i, &mut strings).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let properties = (0..header.properties.count)
            .map(|i| source.decode::<Property>(header, i, &mut strings).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let offsets = header.profile_offsets;
        let bytes = source.read_at(u64::from(offsets.offset), offsets.count as usize * 8)?;
        let profile_offsets = read_records::<ProfileOffset>(&bytes, offsets.count as usize, "profile offset")?.0;

        Ok(Metadata {
            name,
            components,
            properties,
            root_nodes: source.u32_array(header.root_nodes, "root nodes")?,
            ranked_signature_indexes: source
                .u32_array(header.ranked_signature_indexes, "ranked signature indexes")?,
            profile_offsets,
        })
    }
}

/// Per-kind cache counters of a stream-backed dataset
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DatasetCacheStats {
    /// String cache
    pub strings: CacheStats,
    /// Value cache
    pub values: CacheStats,
    /// Profile cache
    pub profiles: CacheStats,
    /// Signature cache
    pub signatures: CacheStats,
    /// Node cache
    pub nodes: CacheStats,
}

/// A loaded device detection dataset
///
/// `Dataset` is `Send + Sync`; share it across threads with an `Arc`.
/// Entities are read-only once decoded. After [`Dataset::dispose`] every
/// read fails with [`UamatchError::Disposed`].
pub struct Dataset {
    name: String,
    mode: LoadMode,
    header: DatasetHeader,
    components: Vec<Arc<Component>>,
    properties: Vec<Arc<Property>>,
    property_names: HashMap<String, u32>,
    http_headers: Vec<String>,
    root_nodes: Vec<u32>,
    ranked_signature_indexes: Vec<u32>,
    profile_offsets: Vec<ProfileOffset>,
    store: EntityStore,
    disposed: AtomicBool,
}

impl Dataset {
    /// Create an opener for the dataset file at `path`
    pub fn from(path: impl Into<PathBuf>) -> DatasetOpener {
        DatasetOpener::new(path)
    }

    /// Create an opener over dataset bytes
    pub fn from_bytes_builder(bytes: Vec<u8>) -> DatasetOpener {
        DatasetOpener::from_bytes_builder(bytes)
    }

    /// Open dataset bytes fully in memory
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_bytes_builder(bytes).open()
    }

    /// Open a dataset with custom options (lower-level API)
    ///
    /// Most users should use [`Dataset::from`] instead.
    pub fn open_with_options(options: DatasetOptions) -> Result<Self> {
        let DatasetOptions {
            path,
            bytes,
            mode,
            cache_capacity,
            max_readers,
        } = options;

        let dataset = match (mode, bytes) {
            (LoadMode::Memory, Some(bytes)) => Self::load_memory(&bytes)?,
            (LoadMode::Memory, None) => {
                let file = File::open(&path)?;
                // SAFETY: the mapping is read-only and dropped before this call
                // returns; every entity is copied out of it while decoding.
                let mmap = unsafe { Mmap::map(&file) }?;
                Self::load_memory(&mmap)?
            }
            (LoadMode::Stream, bytes) => {
                let source = match bytes {
                    Some(bytes) => DataSource::Memory(bytes.into()),
                    None => DataSource::File(path),
                };
                Self::load_stream(ReaderPool::new(source, max_readers)?, cache_capacity)?
            }
        };

        debug!(
            name = %dataset.name,
            mode = %dataset.mode,
            components = dataset.components.len(),
            properties = dataset.properties.len(),
            profiles = dataset.header.profiles.count,
            signatures = dataset.header.signatures.count,
            nodes = dataset.header.nodes.count,
            "dataset opened"
        );
        Ok(dataset)
    }

    fn load_memory(data: &[u8]) -> Result<Self> {
        let header = DatasetHeader::read(data)?;
        let source = Source::Slice(data);
        let metadata = Metadata::load(&source, &header)?;

        let strings = source.decode_all::<AsciiString>(&header, &[])?;
        let store = MemoryStore {
            values: source.decode_all(&header, &strings)?,
            profiles: source.decode_all(&header, &strings)?,
            signatures: source.decode_all(&header, &strings)?,
            nodes: source.decode_all(&header, &strings)?,
            strings,
        };
        Self::assemble(header, metadata, LoadMode::Memory, EntityStore::Memory(store))
    }

    fn load_stream(pool: ReaderPool, cache_capacity: usize) -> Result<Self> {
        let (header, metadata) = {
            let source = Source::Pool(&pool);
            let header =
                DatasetHeader::read(&source.read_at(0, std::mem::size_of::<DatasetHeader>())?)?;
            let metadata = Metadata::load(&source, &header)?;
            (header, metadata)
        };

        let store = StreamStore {
            pool,
            strings: LruCache::new(cache_capacity),
            values: LruCache::new(cache_capacity),
            profiles: LruCache::new(cache_capacity),
            signatures: LruCache::new(cache_capacity),
            nodes: LruCache::new(cache_capacity),
        };
        Self::assemble(header, metadata, LoadMode::Stream, EntityStore::Stream(store))
    }

    fn assemble(header: DatasetHeader, metadata: Metadata, mode: LoadMode, store: EntityStore) -> Result<Self> {
        let profile_count = header.profiles.count;
        for component in &metadata.components {
            if component.default_profile() >= profile_count {
                return Err(FormatError::OutOfBounds(format!(
                    "component '{}' default profile {} (count {})",
                    component.name(),
                    component.default_profile(),
                    profile_count
                ))
                .into());
            }
        }

        let property_names = metadata
            .properties
            .iter()
            .map(|p| (p.name().to_string(), p.index()))
            .collect();

        let mut http_headers: Vec<String> = Vec::new();
        for component in &metadata.components {
            for header in component.http_headers() {
                if !http_headers.iter().any(|h| h.eq_ignore_ascii_case(header)) {
                    http_headers.push(header.clone());
                }
            }
        }

        Ok(Dataset {
            name: metadata.name,
            mode,
            header,
            components: metadata.components,
            properties: metadata.properties,
            property_names,
            http_headers,
            root_nodes: metadata.root_nodes,
            ranked_signature_indexes: metadata.ranked_signature_indexes,
            profile_offsets: metadata.profile_offsets,
            store,
            disposed: AtomicBool::new(false),
        })
    }

    /// Fail fast once the dataset has been disposed
    pub(crate) fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(UamatchError::Disposed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn entity<T: Entity>(&self, index: u32) -> Result<Arc<T>> {
        self.check_disposed()?;
        match &self.store {
            EntityStore::Memory(store) => T::in_memory(store)
                .get(index as usize)
                .cloned()
                .ok_or_else(|| {
                    FormatError::OutOfBounds(format!(
                        "{} index {} (count {})",
                        T::KIND.as_str(),
                        index,
                        T::in_memory(store).len()
                    ))
                    .into()
                }),
            EntityStore::Stream(store) => T::in_cache(store).get_or_load(&index, |&i| {
                // The reader goes back to the pool before nested string reads
                let bytes = store.pool.read_record(self.header.section(T::KIND), T::KIND, i)?;
                T::decode(i, &bytes, &mut |s: u32| self.string(s))
            }),
        }
    }

    /// Dataset name from the header
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Loading strategy
    pub fn mode(&self) -> LoadMode {
        self.mode
    }

    /// Targets shorter than this resolve to default profiles
    pub fn min_user_agent_length(&self) -> usize {
        self.header.min_user_agent_length as usize
    }

    /// Maximum candidate signatures scored per match
    pub fn max_signatures(&self) -> usize {
        self.header.max_signatures as usize
    }

    /// Maximum candidates scored by the closest pass
    pub fn max_signatures_closest(&self) -> usize {
        self.header.max_signatures_closest as usize
    }

    /// Components in dataset order
    pub fn components(&self) -> &[Arc<Component>] {
        &self.components
    }

    /// Properties in dataset order
    pub fn properties(&self) -> &[Arc<Property>] {
        &self.properties
    }

    /// Every HTTP header some component considers relevant
    pub fn http_headers(&self) -> &[String] {
        &self.http_headers
    }

    /// Number of signatures
    pub fn signature_count(&self) -> usize {
        self.header.signatures.count as usize
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.header.nodes.count as usize
    }

    /// Number of profiles
    pub fn profile_count(&self) -> usize {
        self.header.profiles.count as usize
    }

    /// Number of values
    pub fn value_count(&self) -> usize {
        self.header.values.count as usize
    }

    /// Length of the root node catalog
    pub fn root_node_count(&self) -> usize {
        self.root_nodes.len()
    }

    /// Node by offset
    pub fn node(&self, index: u32) -> Result<Arc<Node>> {
        self.entity(index)
    }

    /// Signature by index
    pub fn signature(&self, index: u32) -> Result<Arc<Signature>> {
        self.entity(index)
    }

    /// Profile by index
    pub fn profile(&self, index: u32) -> Result<Arc<Profile>> {
        self.entity(index)
    }

    /// Value by index
    pub fn value(&self, index: u32) -> Result<Arc<Value>> {
        self.entity(index)
    }

    /// String by index
    pub fn string(&self, index: u32) -> Result<Arc<AsciiString>> {
        self.entity(index)
    }

    /// Root node for matching at character `position`, if any node ends there
    pub fn root_node(&self, position: usize) -> Result<Option<Arc<Node>>> {
        match self.root_nodes.get(position) {
            Some(&index) if index != NONE => self.node(index).map(Some),
            _ => {
                self.check_disposed()?;
                Ok(None)
            }
        }
    }

    /// Signature index holding popularity `rank`
    pub fn ranked_signature_index(&self, rank: u32) -> Option<u32> {
        self.ranked_signature_indexes.get(rank as usize).copied()
    }

    /// Find a profile by id
    ///
    /// Returns `Ok(None)` when no profile has that id.
    pub fn find_profile(&self, profile_id: u32) -> Result<Option<Arc<Profile>>> {
        self.check_disposed()?;
        match self
            .profile_offsets
            .binary_search_by_key(&profile_id, |o| o.profile_id)
        {
            Ok(i) => self.profile(self.profile_offsets[i].profile_index).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Find the signature whose node offsets equal `node_offsets`
    pub fn find_signature(&self, node_offsets: &[u32]) -> Result<Option<Arc<Signature>>> {
        let mut reads = 0;
        self.find_signature_counted(node_offsets, &mut reads)
    }

    /// [`Dataset::find_signature`], counting the signatures read
    pub(crate) fn find_signature_counted(
        &self,
        node_offsets: &[u32],
        reads: &mut u32,
    ) -> Result<Option<Arc<Signature>>> {
        self.check_disposed()?;
        let found = binary_search(self.signature_count(), |i| {
            *reads += 1;
            Ok::<_, UamatchError>(compare_offsets(self.signature(i as u32)?.node_offsets(), node_offsets))
        })?;
        match found {
            Ok(i) => self.signature(i as u32).map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Property by name
    pub fn find_property(&self, name: &str) -> Option<&Arc<Property>> {
        self.property_names
            .get(name)
            .and_then(|&i| self.properties.get(i as usize))
    }

    /// Default profile of every component, in component order
    pub fn default_profiles(&self) -> Result<Vec<Arc<Profile>>> {
        self.components
            .iter()
            .map(|c| self.profile(c.default_profile()))
            .collect()
    }

    /// Values `profile` holds for `property`, in value order
    pub fn profile_values(&self, profile: &Profile, property: &Property) -> Result<Vec<Arc<Value>>> {
        profile
            .values_for(property)
            .iter()
            .map(|&v| self.value(v))
            .collect()
    }

    /// Per-kind cache counters; `None` for memory-resident datasets
    pub fn cache_stats(&self) -> Option<DatasetCacheStats> {
        match &self.store {
            EntityStore::Memory(_) => None,
            EntityStore::Stream(store) => Some(DatasetCacheStats {
                strings: store.strings.stats(),
                values: store.values.stats(),
                profiles: store.profiles.stats(),
                signatures: store.signatures.stats(),
                nodes: store.nodes.stats(),
            }),
        }
    }

    /// Readers opened by the stream pool; 0 for memory-resident datasets
    pub fn readers_created(&self) -> usize {
        match &self.store {
            EntityStore::Memory(_) => 0,
            EntityStore::Stream(store) => store.pool.readers_created(),
        }
    }

    /// Clear every entity cache and its counters
    pub fn reset_cache(&self) {
        if let EntityStore::Stream(store) = &self.store {
            store.strings.reset();
            store.values.reset();
            store.profiles.reset();
            store.signatures.reset();
            store.nodes.reset();
        }
        debug!(name = %self.name, mode = %self.mode, "dataset caches reset");
    }

    /// Release backing readers; every later read fails with `Disposed`
    ///
    /// Disposing twice is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let EntityStore::Stream(store) = &self.store {
            store.pool.close();
            store.strings.reset();
            store.values.reset();
            store.profiles.reset();
            store.signatures.reset();
            store.nodes.reset();
        }
        debug!(name = %self.name, "dataset disposed");
    }

    /// Whether [`Dataset::dispose`] has been called
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dataset")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("components", &self.components.len())
            .field("signatures", &self.header.signatures.count)
            .field("nodes", &self.header.nodes.count)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
