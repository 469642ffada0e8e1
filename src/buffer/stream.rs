use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How much of the resident data a consumer wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Take {
    All,
    Upto(usize),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Bytes ever appended by the writer.
    pub written: u64,
    /// Bytes handed out and not given back.
    pub delivered: u64,
    /// Bytes currently held.
    pub resident: u64,
}

#[derive(Default)]
struct Inner {
    data: VecDeque<u8>,
    written: u64,
    consumed: u64,
    returned: u64,
}

/// Growable byte store shared by one download worker and the decode step.
///
/// Every call takes the lock for its own duration only, so a single append is
/// never observed half-written. Readers that fail to decode what they took must
/// hand the unused tail back with [`StreamBuffer::return_remainder`].
pub struct StreamBuffer {
    inner: Mutex<Inner>,
}

impl StreamBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.data.extend(bytes);
        inner.written += bytes.len() as u64;
    }

    /// Removes and returns the requested prefix. Empty when nothing is resident.
    /// Costs O(n) in the bytes taken, not in the bytes resident.
    pub fn consume_prefix(&self, take: Take) -> Vec<u8> {
        let mut inner = self.lock();
        let n = match take {
            Take::All => inner.data.len(),
            Take::Upto(n) => n.min(inner.data.len()),
        };
        if n == 0 {
            return Vec::new();
        }
        inner.consumed += n as u64;
        inner.data.drain(..n).collect()
    }

    /// Puts bytes taken by [`consume_prefix`](Self::consume_prefix) back at the
    /// front, ahead of anything appended since.
    pub fn return_remainder(&self, remainder: &[u8]) {
        if remainder.is_empty() {
            return;
        }
        let mut inner = self.lock();
        inner.data.reserve(remainder.len());
        for &byte in remainder.iter().rev() {
            inner.data.push_front(byte);
        }
        inner.returned += remainder.len() as u64;
    }

    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.lock();
        BufferStats {
            written: inner.written,
            delivered: inner.consumed - inner.returned,
            resident: inner.data.len() as u64,
        }
    }
}
