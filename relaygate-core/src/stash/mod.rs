//! Body stores for message content.
//!
//! A [`Stash`] holds one message body so that it can be read any number of
//! times. Routing nodes and the inbound service never create stashes
//! directly; they are handed a [`StashFactory`] at construction, which picks
//! the buffering strategy (memory only, or memory spilling to a temporary
//! file past a threshold).
//!
//! # Size ceiling
//!
//! Every stash carries an optional byte ceiling. A write that would push the
//! stored length past it fails with [`StashError::LimitExceeded`] and leaves
//! the previously stored bytes untouched.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

/// Errors raised by a body store.
#[derive(Debug, Error)]
pub enum StashError {
    /// Writing would exceed the stash's ceiling.
    #[error("body exceeds {limit} byte limit")]
    LimitExceeded { limit: u64 },

    /// Spill file I/O failed.
    #[error("stash I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A write-then-read-many body store.
pub trait Stash: Send + Sync + fmt::Debug {
    /// Append a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`StashError::LimitExceeded`] when the ceiling would be passed.
    fn write(&mut self, chunk: Bytes) -> Result<(), StashError>;

    /// Number of bytes stored so far.
    fn len(&self) -> u64;

    /// True when nothing has been written.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read the full stored body. May be called repeatedly.
    fn read_all(&self) -> Result<Bytes, StashError>;
}

/// Creates body stores with a fixed buffering strategy.
pub trait StashFactory: Send + Sync + fmt::Debug {
    /// Create an empty stash with the given ceiling.
    fn create(&self, limit: Option<u64>) -> Box<dyn Stash>;
}

fn check_limit(limit: Option<u64>, current: u64, incoming: usize) -> Result<(), StashError> {
    match limit {
        Some(limit) if current + incoming as u64 > limit => Err(StashError::LimitExceeded { limit }),
        _ => Ok(()),
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Keeps the whole body in memory as a list of shared chunks.
#[derive(Debug, Default)]
pub struct MemoryStash {
    chunks: Vec<Bytes>,
    len: u64,
    limit: Option<u64>,
}

impl MemoryStash {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
            limit,
        }
    }

    /// Build a stash already holding `content`, bypassing the ceiling.
    pub fn from_bytes(content: Bytes) -> Self {
        let len = content.len() as u64;
        Self {
            chunks: if content.is_empty() { Vec::new() } else { vec![content] },
            len,
            limit: None,
        }
    }

    fn drain(&mut self) -> Vec<Bytes> {
        self.len = 0;
        std::mem::take(&mut self.chunks)
    }
}

impl Stash for MemoryStash {
    fn write(&mut self, chunk: Bytes) -> Result<(), StashError> {
        check_limit(self.limit, self.len, chunk.len())?;
        if chunk.is_empty() {
            return Ok(());
        }
        self.len += chunk.len() as u64;
        self.chunks.push(chunk);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_all(&self) -> Result<Bytes, StashError> {
        match self.chunks.as_slice() {
            [] => Ok(Bytes::new()),
            [single] => Ok(single.clone()),
            many => {
                let mut buf = BytesMut::with_capacity(self.len as usize);
                for chunk in many {
                    buf.extend_from_slice(chunk);
                }
                Ok(buf.freeze())
            }
        }
    }
}

/// Factory for [`MemoryStash`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryStashFactory;

impl StashFactory for MemoryStashFactory {
    fn create(&self, limit: Option<u64>) -> Box<dyn Stash> {
        Box::new(MemoryStash::new(limit))
    }
}

// ============================================================================
// Spill to disk
// ============================================================================

/// Buffers in memory until `threshold` bytes, then moves everything into an
/// anonymous temporary file.
#[derive(Debug)]
pub struct SpillingStash {
    threshold: u64,
    limit: Option<u64>,
    memory: MemoryStash,
    spill: Option<File>,
    len: u64,
}

impl SpillingStash {
    pub fn new(threshold: u64, limit: Option<u64>) -> Self {
        Self {
            threshold,
            limit,
            memory: MemoryStash::new(None),
            spill: None,
            len: 0,
        }
    }

    /// Whether the body has moved to disk.
    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    fn spill_file(&mut self) -> Result<&mut File, StashError> {
        if self.spill.is_none() {
            let mut file = tempfile::tempfile()?;
            for chunk in self.memory.drain() {
                file.write_all(&chunk)?;
            }
            debug!(bytes = self.len, threshold = self.threshold, "Body spilled to disk");
            self.spill = Some(file);
        }
        match self.spill.as_mut() {
            Some(file) => Ok(file),
            None => Err(StashError::Io(std::io::Error::other("spill file missing"))),
        }
    }
}

impl Stash for SpillingStash {
    fn write(&mut self, chunk: Bytes) -> Result<(), StashError> {
        check_limit(self.limit, self.len, chunk.len())?;
        let incoming = chunk.len() as u64;
        if self.spill.is_none() && self.len + incoming <= self.threshold {
            self.memory.write(chunk)?;
        } else {
            self.spill_file()?.write_all(&chunk)?;
        }
        self.len += incoming;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn read_all(&self) -> Result<Bytes, StashError> {
        match &self.spill {
            None => self.memory.read_all(),
            Some(file) => {
                let mut reader = file;
                reader.seek(SeekFrom::Start(0))?;
                let mut buf = Vec::with_capacity(self.len as usize);
                reader.read_to_end(&mut buf)?;
                reader.seek(SeekFrom::End(0))?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Factory for [`SpillingStash`].
#[derive(Debug, Clone, Copy)]
pub struct SpillingStashFactory {
    pub threshold: u64,
}

impl StashFactory for SpillingStashFactory {
    fn create(&self, limit: Option<u64>) -> Box<dyn Stash> {
        Box::new(SpillingStash::new(self.threshold, limit))
    }
}

/// Default factory shared by components that were not given one.
pub fn default_factory() -> Arc<dyn StashFactory> {
    Arc::new(MemoryStashFactory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stash_rereads() {
        let mut stash = MemoryStash::new(None);
        stash.write(Bytes::from_static(b"hello ")).unwrap();
        stash.write(Bytes::from_static(b"world")).unwrap();
        assert_eq!(stash.len(), 11);
        assert_eq!(&stash.read_all().unwrap()[..], b"hello world");
        assert_eq!(&stash.read_all().unwrap()[..], b"hello world");
    }

    #[test]
    fn memory_stash_enforces_limit() {
        let mut stash = MemoryStash::new(Some(4));
        stash.write(Bytes::from_static(b"abc")).unwrap();
        let err = stash.write(Bytes::from_static(b"de")).unwrap_err();
        assert!(matches!(err, StashError::LimitExceeded { limit: 4 }));
        assert_eq!(&stash.read_all().unwrap()[..], b"abc");
    }

    #[test]
    fn spilling_stash_moves_to_disk_past_threshold() {
        let mut stash = SpillingStash::new(8, None);
        stash.write(Bytes::from_static(b"12345")).unwrap();
        assert!(!stash.is_spilled());
        stash.write(Bytes::from_static(b"67890")).unwrap();
        assert!(stash.is_spilled());
        assert_eq!(&stash.read_all().unwrap()[..], b"1234567890");

        stash.write(Bytes::from_static(b"ab")).unwrap();
        assert_eq!(&stash.read_all().unwrap()[..], b"1234567890ab");
        assert_eq!(stash.len(), 12);
    }

    #[test]
    fn factories_apply_limit() {
        let mut stash = SpillingStashFactory { threshold: 2 }.create(Some(3));
        assert!(stash.write(Bytes::from_static(b"abcd")).is_err());
        assert!(stash.is_empty());
    }
}
