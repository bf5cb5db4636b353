use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Size of every pooled slot. Matches the per-client read chunk so one relay
/// read never spans more than a couple of chunks.
pub const CHUNK_CAPACITY: usize = 4096;

/// A fixed-capacity byte slot handed out by the pool. Filled once, then
/// typically shared read-only (`Rc<PoolChunk>`) across the write queues of
/// every relay target; the Rc strong count is the chunk's reference count.
#[derive(Debug)]
pub struct PoolChunk {
    data: Box<[u8]>,
    len: usize,
    allocated_at: Instant,
    last_accessed: Instant,
}

impl PoolChunk {
    fn new(now: Instant) -> PoolChunk {
        PoolChunk {
            data: vec![0u8; CHUNK_CAPACITY].into_boxed_slice(),
            len: 0,
            allocated_at: now,
            last_accessed: now,
        }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        CHUNK_CAPACITY - self.len
    }

    #[inline]
    pub fn age(&self, now: Instant) -> Duration {
        now.duration_since(self.allocated_at)
    }

    /// Appends as much of `src` as fits. Returns bytes taken.
    pub fn push(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.remaining());
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum PoolError {
    /// Memory usage crossed the flow-control fraction of the cap.
    FlowControlActive,
    /// The hard cap itself is spent.
    Exhausted,
}

#[derive(Debug, Copy, Clone)]
pub struct PoolStats {
    pub allocated_chunks: usize,
    pub in_use: usize,
    pub used_bytes: usize,
    pub capacity_bytes: usize,
}

impl PoolStats {
    #[inline]
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.capacity_bytes as f64
    }
}

struct PoolInner {
    free: Vec<PoolChunk>,
    allocated: usize,
    in_use: usize,
}

/// Fixed-slot buffer allocator. One mutex serializes all operations so exec
/// session threads can share a pool with the broker thread.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    max_bytes: usize,
    flow_fraction: f64,
}

impl BufferPool {
    pub fn new(max_bytes: usize, flow_fraction: f64) -> BufferPool {
        assert!(max_bytes >= CHUNK_CAPACITY, "Pool cap below one chunk");
        assert!(
            flow_fraction > 0.0 && flow_fraction <= 1.0,
            "Flow fraction must be in (0, 1]"
        );

        BufferPool {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                allocated: 0,
                in_use: 0,
            }),
            max_bytes,
            flow_fraction,
        }
    }

    pub fn acquire(&self, now: Instant) -> Result<PoolChunk, PoolError> {
        let mut inner = self.inner.lock().expect("Buffer pool mutex poisoned");

        // A fraction of 1.0 disables the flow toggle and leaves only the
        // hard cap.
        let next_usage = (inner.in_use + 1) * CHUNK_CAPACITY;
        if self.flow_fraction < 1.0
            && next_usage as f64 > self.flow_fraction * self.max_bytes as f64
        {
            return Err(PoolError::FlowControlActive);
        }

        if let Some(mut chunk) = inner.free.pop() {
            chunk.len = 0;
            chunk.last_accessed = now;
            inner.in_use += 1;
            return Ok(chunk);
        }

        if (inner.allocated + 1) * CHUNK_CAPACITY > self.max_bytes {
            return Err(PoolError::Exhausted);
        }

        inner.allocated += 1;
        inner.in_use += 1;
        Ok(PoolChunk::new(now))
    }

    pub fn release(&self, mut chunk: PoolChunk, now: Instant) {
        let mut inner = self.inner.lock().expect("Buffer pool mutex poisoned");

        chunk.len = 0;
        chunk.last_accessed = now;
        inner.in_use = inner
            .in_use
            .checked_sub(1)
            .expect("Release without matching acquire");
        inner.free.push(chunk);
    }

    /// Drops free slots that have sat idle past `max_idle`. Returns how many
    /// were reclaimed.
    pub fn cleanup(&self, max_idle: Duration, now: Instant) -> usize {
        let mut inner = self.inner.lock().expect("Buffer pool mutex poisoned");

        let before = inner.free.len();
        inner
            .free
            .retain(|chunk| now.duration_since(chunk.last_accessed) < max_idle);
        let dropped = before - inner.free.len();
        inner.allocated -= dropped;
        dropped
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("Buffer pool mutex poisoned");

        PoolStats {
            allocated_chunks: inner.allocated,
            in_use: inner.in_use,
            used_bytes: inner.in_use * CHUNK_CAPACITY,
            capacity_bytes: self.max_bytes,
        }
    }

    #[inline]
    pub fn usage_fraction(&self) -> f64 {
        self.stats().usage_fraction()
    }
}
