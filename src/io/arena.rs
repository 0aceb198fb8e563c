//! The engine's heap: a fixed byte budget carved at construction, handed out
//! as `IoBuffer` blocks and returned on drop.
//!
//! The orchestrator takes its fixed bucket buffers from here once, and the
//! remainder services the transient read/write buffers of the three steps.
//! Blocking allocation participates in backpressure: a caller asking for
//! more than is currently free parks until another buffer is released.
//! If nothing is outstanding that could ever be released, the allocator
//! reports exhaustion instead of deadlocking.
//!
//! Buffers are backed by `u64` words so that every `u16`/`u32`/`u64` view
//! taken through `bytemuck` is alignment-safe.

use std::sync::{Arc, Condvar, Mutex};

use crate::error::PlotpressError;

#[derive(Clone)]
pub struct Arena {
    inner: Arc<ArenaInner>,
}

#[derive(Debug)]
struct ArenaInner {
    capacity: usize,
    state: Mutex<ArenaState>,
    cond: Condvar,
}

#[derive(Debug)]
struct ArenaState {
    in_use: usize,
    outstanding: usize,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ArenaInner {
                capacity,
                state: Mutex::new(ArenaState {
                    in_use: 0,
                    outstanding: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Bytes currently allocated.
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().unwrap().in_use
    }

    /// Allocates a zeroed buffer of at least `bytes` bytes (rounded up to
    /// whole u64 words).
    ///
    /// With `block` set, waits for released buffers until the request fits;
    /// returns `ArenaExhausted` when waiting cannot ever succeed. Without
    /// `block`, returns `Ok(None)` when the request does not fit right now.
    pub fn alloc(&self, bytes: usize, block: bool) -> Result<Option<IoBuffer>, PlotpressError> {
        let bytes = bytes.div_ceil(8) * 8;
        let mut state = self.inner.state.lock().unwrap();

        loop {
            if self.inner.capacity - state.in_use >= bytes {
                state.in_use += bytes;
                state.outstanding += 1;
                return Ok(Some(IoBuffer {
                    words: vec![0u64; bytes / 8],
                    bytes,
                    arena: Some(self.inner.clone()),
                }));
            }

            if !block {
                return Ok(None);
            }

            // Waiting is only meaningful if some other buffer can still be
            // released, and the request fits an empty arena at all.
            if state.outstanding == 0 || bytes > self.inner.capacity {
                return Err(PlotpressError::ArenaExhausted {
                    requested: bytes,
                    available: self.inner.capacity - state.in_use,
                    capacity: self.inner.capacity,
                    outstanding: state.outstanding,
                });
            }

            state = self.inner.cond.wait(state).unwrap();
        }
    }
}

/// An owned block of the engine heap. Dropping the buffer returns its bytes
/// to the arena and wakes blocked allocators; this is the release half of
/// the queue's get/release buffer contract.
#[derive(Debug)]
pub struct IoBuffer {
    words: Vec<u64>,
    bytes: usize,
    arena: Option<Arc<ArenaInner>>,
}

impl IoBuffer {
    /// A free-standing buffer not accounted to any arena (tests, oracles).
    pub fn standalone(bytes: usize) -> Self {
        let bytes = bytes.div_ceil(8) * 8;
        Self {
            words: vec![0u64; bytes / 8],
            bytes,
            arena: None,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.bytes]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.bytes]
    }

    pub fn as_u16s(&self) -> &[u16] {
        bytemuck::cast_slice(&self.words[..self.bytes / 8])
    }

    pub fn as_u16s_mut(&mut self) -> &mut [u16] {
        bytemuck::cast_slice_mut(&mut self.words[..self.bytes / 8])
    }

    pub fn as_u32s(&self) -> &[u32] {
        bytemuck::cast_slice(&self.words[..self.bytes / 8])
    }

    pub fn as_u32s_mut(&mut self) -> &mut [u32] {
        bytemuck::cast_slice_mut(&mut self.words[..self.bytes / 8])
    }

    pub fn as_u64s(&self) -> &[u64] {
        &self.words[..self.bytes / 8]
    }

    pub fn as_u64s_mut(&mut self) -> &mut [u64] {
        &mut self.words[..self.bytes / 8]
    }
}

impl Drop for IoBuffer {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.take() {
            let mut state = arena.state.lock().unwrap();
            state.in_use -= self.bytes;
            state.outstanding -= 1;
            arena.cond.notify_all();
        }
    }
}
