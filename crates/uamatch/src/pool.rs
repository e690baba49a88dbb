//! Pooled readers for stream-backed datasets
//!
//! A stream-backed dataset decodes entities on demand. Each read checks a
//! reader out of the pool, seeks and reads one record, and hands the reader
//! back when the [`PooledReader`] guard drops, on every exit path. The pool
//! opens readers lazily up to `max_readers`; once they are all checked out,
//! callers block until one is returned. Closing the pool wakes every waiter
//! with [`UamatchError::Disposed`].

use crate::error::{Result, UamatchError};
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use uamatch_format::{record_span, EntityKind, SectionHeader};

/// Where readers get their bytes from
#[derive(Debug, Clone)]
pub(crate) enum DataSource {
    /// A dataset file, opened once per pooled reader
    File(PathBuf),
    /// Shared in-memory bytes read through a cursor
    Memory(Arc<[u8]>),
}

/// A seekable byte reader that can move between threads
pub(crate) trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

type Reader = Box<dyn ReadSeek>;

struct PoolState {
    idle: Vec<Reader>,
    created: usize,
    closed: bool,
}

/// Bounded pool of readers over one data source
pub(crate) struct ReaderPool {
    source: DataSource,
    len: u64,
    max_readers: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ReaderPool {
    /// Create a pool; no reader is opened until the first checkout
    pub fn new(source: DataSource, max_readers: usize) -> Result<Self> {
        let len = match &source {
            DataSource::File(path) => std::fs::metadata(path)?.len(),
            DataSource::Memory(bytes) => bytes.len() as u64,
        };
        Ok(Self {
            source,
            len,
            max_readers: max_readers.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                created: 0,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_reader(&self) -> Result<Reader> {
        Ok(match &self.source {
            DataSource::File(path) => Box::new(BufReader::new(File::open(path)?)),
            DataSource::Memory(bytes) => Box::new(Cursor::new(Arc::clone(bytes))),
        })
    }

    /// Check out a reader, blocking while all of them are in use
    pub fn acquire(&self) -> Result<PooledReader<'_>> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(UamatchError::Disposed);
            }
            if let Some(reader) = state.idle.pop() {
                return Ok(PooledReader {
                    pool: self,
                    reader: Some(reader),
                });
            }
            if state.created < self.max_readers {
                state.created += 1;
                drop(state);
                return match self.open_reader() {
                    Ok(reader) => Ok(PooledReader {
                        pool: self,
                        reader: Some(reader),
                    }),
                    Err(e) => {
                        self.lock().created -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn release(&self, reader: Reader) {
        let mut state = self.lock();
        if state.closed {
            state.created -= 1;
        } else {
            state.idle.push(reader);
        }
        drop(state);
        self.available.notify_one();
    }

    /// Read `len` bytes at `offset`
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset.saturating_add(len as u64) > self.len {
            return Err(uamatch_format::FormatError::OutOfBounds(format!(
                "read of {} bytes at {} beyond source of {} bytes",
                len, offset, self.len
            ))
            .into());
        }
        let mut reader = self.acquire()?;
        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read the raw bytes of record `index` in an entity section
    pub fn read_record(&self, section: SectionHeader, kind: EntityKind, index: u32) -> Result<Vec<u8>> {
        if index >= section.count {
            return Err(uamatch_format::FormatError::OutOfBounds(format!(
                "{} index {} (count {})",
                kind.as_str(),
                index,
                section.count
            ))
            .into());
        }
        let mut reader = self.acquire()?;
        reader.seek(SeekFrom::Start(section.index_entry(index)))?;
        let mut pair = [0u8; 8];
        reader.read_exact(&mut pair)?;
        let start = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]);
        let end = u32::from_le_bytes([pair[4], pair[5], pair[6], pair[7]]);
        let range = record_span(start, end, self.len, kind, index)?;
        reader.seek(SeekFrom::Start(u64::from(start)))?;
        let mut buf = vec![0u8; range.len()];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Readers opened so far and not yet discarded
    pub fn readers_created(&self) -> usize {
        self.lock().created
    }

    /// Drop idle readers and fail every current and future checkout
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let idle = state.idle.len();
        state.idle.clear();
        state.created -= idle;
        drop(state);
        self.available.notify_all();
    }
}

/// A checked-out reader, returned to its pool on drop
pub(crate) struct PooledReader<'a> {
    pool: &'a ReaderPool,
    reader: Option<Reader>,
}

impl Deref for PooledReader<'_> {
    type Target = dyn ReadSeek;

    fn deref(&self) -> &Self::Target {
        match &self.reader {
            Some(reader) => reader.as_ref(),
            None => unreachable!("reader is only taken on drop"),
        }
    }
}

impl DerefMut for PooledReader<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.reader {
            Some(reader) => reader.as_mut(),
            None => unreachable!("reader is only taken on drop"),
        }
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.pool.release(reader);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    fn memory_pool(max: usize) -> ReaderPool {
        let bytes: Arc<[u8]> = (0u8..64).collect::<Vec<_>>().into();
        ReaderPool::new(DataSource::Memory(bytes), max).unwrap()
    }

    #[test]
    fn test_read_at() {
        let pool = memory_pool(2);
        assert_eq!(pool.read_at(10, 3).unwrap(), vec![10, 11, 12]);
        assert!(pool.read_at(62, 4).is_err());
        // The reader went back to the pool
        assert_eq!(pool.readers_created(), 1);
    }

    #[test]
    fn test_readers_are_reused() {
        let pool = memory_pool(4);
        for _ in 0..10 {
            pool.read_at(0, 1).unwrap();
        }
        assert_eq!(pool.readers_created(), 1);
    }

    #[test]
    fn test_exhausted_pool_blocks_until_release() {
        let pool = memory_pool(1);
        let released = AtomicBool::new(false);
        thread::scope(|s| {
            let guard = pool.acquire().unwrap();
            let waiter = s.spawn(|| {
                let _reader = pool.acquire().unwrap();
                assert!(released.load(Ordering::SeqCst));
            });
            thread::sleep(Duration::from_millis(50));
            released.store(true, Ordering::SeqCst);
            drop(guard);
            waiter.join().unwrap();
        });
        assert_eq!(pool.readers_created(), 1);
    }

    #[test]
    fn test_close_fails_waiters_and_new_checkouts() {
        let pool = memory_pool(1);
        thread::scope(|s| {
            let guard = pool.acquire().unwrap();
            let waiter = s.spawn(|| pool.acquire().map(|_| ()));
            thread::sleep(Duration::from_millis(50));
            pool.close();
            assert!(matches!(waiter.join().unwrap(), Err(UamatchError::Disposed)));
            drop(guard);
        });
        assert!(matches!(pool.acquire(), Err(UamatchError::Disposed)));
        assert_eq!(pool.readers_created(), 0);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = ReaderPool::new(DataSource::File("/nonexistent/uamatch.dat".into()), 1);
        assert!(matches!(result, Err(UamatchError::Io(_))));
    }
}
