//! Pooled fixed-capacity packets.
//!
//! A [`PacketPool`] preallocates `capacity` buffers. [`PacketPool::acquire`] blocks while all
//! of them are handed out; that wait is the pipeline's only backpressure. A [`Packet`] is a
//! move-only handle: sending it through a channel transfers ownership to the next stage, and
//! dropping it returns the buffer to its pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::interrupt::Interrupt;

/// How long a blocked acquire sleeps before re-checking the interrupt flag.
const ACQUIRE_POLL: Duration = Duration::from_millis(20);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet capacity exceeded: need {needed} bytes, capacity {capacity}")]
    CapacityExceeded { needed: usize, capacity: usize },
}

/// Packet flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const END_OF_STREAM: PacketFlags = PacketFlags(0x01);

    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }
}

struct PoolShared {
    name: &'static str,
    capacity: usize,
    packet_bytes: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    cv: Condvar,
    outstanding: AtomicUsize,
    interrupt: Interrupt,
}

impl PoolShared {
    fn release(&self, buf: Box<[u8]>) {
        if buf.len() != self.packet_bytes {
            return;
        }
        let mut free = self.free.lock().unwrap();
        free.push(buf);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        drop(free);
        self.cv.notify_one();
    }
}

/// Bounded pool of equally sized packet buffers.
#[derive(Clone)]
pub struct PacketPool {
    shared: Arc<PoolShared>,
}

impl PacketPool {
    /// Preallocate `capacity` buffers of `packet_bytes` each.
    pub fn new(name: &'static str, capacity: usize, packet_bytes: usize, interrupt: Interrupt) -> Self {
        let capacity = capacity.max(1);
        let packet_bytes = packet_bytes.max(1);
        let free = (0..capacity)
            .map(|_| vec![0u8; packet_bytes].into_boxed_slice())
            .collect();
        Self {
            shared: Arc::new(PoolShared {
                name,
                capacity,
                packet_bytes,
                free: Mutex::new(free),
                cv: Condvar::new(),
                outstanding: AtomicUsize::new(0),
                interrupt,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn packet_bytes(&self) -> usize {
        self.shared.packet_bytes
    }

    /// Packets currently handed out (best-effort snapshot).
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /// Take a free packet, blocking while the pool is exhausted.
    ///
    /// Returns `None` once the interrupt flag is raised.
    pub fn acquire(&self) -> Option<Packet> {
        let mut free = self.shared.free.lock().unwrap();
        loop {
            if self.shared.interrupt.is_set() {
                return None;
            }
            if let Some(buf) = free.pop() {
                self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
                drop(free);
                return Some(Packet::new(buf, self.shared.clone()));
            }
            tracing::trace!(pool = self.shared.name, "packet pool exhausted; waiting");
            let (g, _timeout) = self.shared.cv.wait_timeout(free, ACQUIRE_POLL).unwrap();
            free = g;
        }
    }

    /// Like [`PacketPool::acquire`], but waits at most once for `wait`.
    ///
    /// Stages use this so they can drain their control channel while the pool is exhausted.
    pub fn acquire_for(&self, wait: Duration) -> Option<Packet> {
        let mut free = self.shared.free.lock().unwrap();
        if free.is_empty() && !self.shared.interrupt.is_set() {
            free = self.shared.cv.wait_timeout(free, wait).unwrap().0;
        }
        if self.shared.interrupt.is_set() {
            return None;
        }
        let buf = free.pop()?;
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        drop(free);
        Some(Packet::new(buf, self.shared.clone()))
    }

    /// Take a free packet without blocking.
    pub fn try_acquire(&self) -> Option<Packet> {
        let mut free = self.shared.free.lock().unwrap();
        let buf = free.pop()?;
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);
        drop(free);
        Some(Packet::new(buf, self.shared.clone()))
    }

    /// Wake every blocked acquirer so it can observe the interrupt flag.
    pub fn wake_all(&self) {
        let _g = self.shared.free.lock().unwrap();
        self.shared.cv.notify_all();
    }
}

/// Encoded or decoded bytes plus stream bookkeeping.
pub struct Packet {
    buf: Box<[u8]>,
    len: usize,
    /// Stream this packet belongs to.
    pub stream_id: u32,
    /// Flush generation the packet was produced in.
    pub epoch: u64,
    /// Sample position (per channel) of the first sample carried or produced.
    pub stream_position: u64,
    /// Total stream length in samples, when known.
    pub stream_length: Option<u64>,
    pub flags: PacketFlags,
    pool: Arc<PoolShared>,
}

impl Packet {
    fn new(buf: Box<[u8]>, pool: Arc<PoolShared>) -> Self {
        Self {
            buf,
            len: 0,
            stream_id: 0,
            epoch: 0,
            stream_position: 0,
            stream_length: None,
            flags: PacketFlags::default(),
            pool,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Drop the payload, keeping bookkeeping fields.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append bytes; fails without writing when they do not fit.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), PacketError> {
        let needed = self.len + bytes.len();
        if needed > self.buf.len() {
            return Err(PacketError::CapacityExceeded {
                needed,
                capacity: self.buf.len(),
            });
        }
        self.buf[self.len..needed].copy_from_slice(bytes);
        self.len = needed;
        Ok(())
    }

    /// Writable tail of the buffer; commit with [`Packet::set_len`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// Set the payload length (clamped to capacity).
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buf.len());
    }

    /// Append as many whole `f32` samples as fit; returns the count written.
    pub fn push_f32(&mut self, samples: &[f32]) -> usize {
        let room = (self.buf.len() - self.len) / 4;
        let n = room.min(samples.len());
        for (i, s) in samples[..n].iter().enumerate() {
            let at = self.len + i * 4;
            self.buf[at..at + 4].copy_from_slice(&s.to_le_bytes());
        }
        self.len += n * 4;
        n
    }

    /// Decode the payload as little-endian `f32` samples into `out` (cleared first).
    pub fn read_f32_into(&self, out: &mut Vec<f32>) {
        out.clear();
        out.extend(
            self.data()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
        );
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(PacketFlags::END_OF_STREAM)
    }

    pub fn set_end_of_stream(&mut self) {
        self.flags.insert(PacketFlags::END_OF_STREAM);
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.release(buf);
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("pool", &self.pool.name)
            .field("len", &self.len)
            .field("stream_id", &self.stream_id)
            .field("epoch", &self.epoch)
            .field("stream_position", &self.stream_position)
            .field("stream_length", &self.stream_length)
            .field("flags", &self.flags)
            .finish()
    }
}
