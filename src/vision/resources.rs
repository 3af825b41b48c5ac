//! Resource governance
//!
//! Device capability probing, scope-owned buffer tracking and the memory
//! ceiling that throttles recognition batches.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use image::{ImageBuffer, Pixel};
use ndarray::{ArrayBase, Dimension, OwnedRepr};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use sysinfo::System;
use tracing::{debug, info, warn};

use crate::config::DeviceSettings;

/// Capability descriptor computed once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Largest image side the device should process
    pub max_dimension: u32,
    /// Crops per recognition batch
    pub batch_size: usize,
    /// Low-memory / low-core device
    pub is_constrained: bool,
    /// Hardware threads available to the process
    pub parallelism: usize,
}

impl DeviceProfile {
    /// Probe the host once
    pub fn probe(settings: &DeviceSettings) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let mut system = System::new();
        system.refresh_memory();
        let total_memory = system.total_memory();
        let memory_floor = settings.constrained_memory_mb * 1024 * 1024;

        let is_constrained = settings.force_constrained.unwrap_or_else(|| {
            (total_memory > 0 && total_memory < memory_floor) || parallelism <= 2
        });

        let profile = Self::for_capabilities(is_constrained, parallelism, settings);
        info!(
            "Device profile: constrained={}, max_dimension={}, batch_size={}, parallelism={}, memory={} MB",
            profile.is_constrained,
            profile.max_dimension,
            profile.batch_size,
            profile.parallelism,
            total_memory / (1024 * 1024)
        );
        profile
    }

    /// Build a profile from known capabilities
    pub fn for_capabilities(is_constrained: bool, parallelism: usize, settings: &DeviceSettings) -> Self {
        let default_dimension = if is_constrained { 2048 } else { 4096 };
        let batch_size = if is_constrained {
            settings.constrained_batch_size
        } else {
            settings.batch_size
        };

        Self {
            max_dimension: settings.max_dimension.unwrap_or(default_dimension),
            batch_size: batch_size.max(1),
            is_constrained,
            parallelism: parallelism.max(1),
        }
    }

    /// Downscale dimensions so the longer side fits `max_dimension`
    pub fn fit_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let longest = width.max(height);
        if longest <= self.max_dimension || longest == 0 {
            return (width, height);
        }
        let scale = self.max_dimension as f64 / longest as f64;
        (
            ((width as f64 * scale).round() as u32).max(1),
            ((height as f64 * scale).round() as u32).max(1),
        )
    }
}

/// Values whose backing storage the arena can account for
pub trait ByteSize {
    fn byte_size(&self) -> usize;
}

impl<A, D: Dimension> ByteSize for ArrayBase<OwnedRepr<A>, D> {
    fn byte_size(&self) -> usize {
        self.len() * std::mem::size_of::<A>()
    }
}

impl<T> ByteSize for Vec<T> {
    fn byte_size(&self) -> usize {
        self.len() * std::mem::size_of::<T>()
    }
}

impl<P: Pixel<Subpixel = u8>> ByteSize for ImageBuffer<P, Vec<u8>> {
    fn byte_size(&self) -> usize {
        self.as_raw().len()
    }
}

/// Point-in-time allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub live_buffers: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub total_allocations: u64,
}

impl MemorySnapshot {
    /// Sum counters across isolated arenas
    pub fn merge(self, other: MemorySnapshot) -> MemorySnapshot {
        MemorySnapshot {
            live_buffers: self.live_buffers + other.live_buffers,
            live_bytes: self.live_bytes + other.live_bytes,
            peak_bytes: self.peak_bytes + other.peak_bytes,
            total_allocations: self.total_allocations + other.total_allocations,
        }
    }
}

#[derive(Debug, Default)]
struct ArenaCounters {
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    total_allocations: AtomicU64,
}

/// Shared allocation counter for scope-owned buffers
#[derive(Debug, Clone, Default)]
pub struct BufferArena {
    counters: Arc<ArenaCounters>,
}

impl BufferArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a buffer; it is released when the guard drops
    pub fn track<T: ByteSize>(&self, value: T) -> Tracked<T> {
        let bytes = value.byte_size();
        let c = &self.counters;
        c.live_buffers.fetch_add(1, Ordering::SeqCst);
        let live = c.live_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        c.peak_bytes.fetch_max(live, Ordering::SeqCst);
        c.total_allocations.fetch_add(1, Ordering::SeqCst);

        Tracked {
            value,
            guard: Allocation {
                bytes,
                arena: self.clone(),
            },
        }
    }

    /// Open a named unit of work; buffers still live in it at exit are reported
    pub fn scope(&self, name: &'static str) -> ArenaScope {
        ArenaScope {
            name,
            arena: self.clone(),
            entry_buffers: self.snapshot().live_buffers,
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let c = &self.counters;
        MemorySnapshot {
            live_buffers: c.live_buffers.load(Ordering::SeqCst),
            live_bytes: c.live_bytes.load(Ordering::SeqCst),
            peak_bytes: c.peak_bytes.load(Ordering::SeqCst),
            total_allocations: c.total_allocations.load(Ordering::SeqCst),
        }
    }

    fn release(&self, bytes: usize) {
        self.counters.live_buffers.fetch_sub(1, Ordering::SeqCst);
        self.counters.live_bytes.fetch_sub(bytes, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Allocation {
    bytes: usize,
    arena: BufferArena,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.arena.release(self.bytes);
    }
}

/// A buffer owned by a scope, released on every exit path
#[derive(Debug)]
pub struct Tracked<T> {
    value: T,
    guard: Allocation,
}

impl<T> Tracked<T> {
    /// Stop tracking and hand the buffer to a new owner
    pub fn into_inner(self) -> T {
        let Tracked { value, guard } = self;
        drop(guard);
        value
    }

    pub fn tracked_bytes(&self) -> usize {
        self.guard.bytes
    }
}

impl<T> Deref for Tracked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Tracked<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Guard for one unit of work
#[derive(Debug)]
pub struct ArenaScope {
    name: &'static str,
    arena: BufferArena,
    entry_buffers: usize,
}

impl ArenaScope {
    /// Buffers allocated inside this scope that are still alive
    pub fn outstanding(&self) -> usize {
        self.arena
            .snapshot()
            .live_buffers
            .saturating_sub(self.entry_buffers)
    }
}

impl Drop for ArenaScope {
    fn drop(&mut self) {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            debug!("Scope '{}' exited with {} buffers still owned elsewhere", self.name, outstanding);
        }
    }
}

/// Allocation limits above which recognition must flush before continuing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCeiling {
    pub max_buffers: usize,
    pub max_bytes: usize,
}

impl MemoryCeiling {
    pub fn for_profile(profile: &DeviceProfile, settings: &DeviceSettings) -> Self {
        let (buffers, megabytes) = if profile.is_constrained { (64, 256) } else { (512, 2048) };
        Self {
            max_buffers: settings.max_live_buffers.unwrap_or(buffers),
            max_bytes: settings.max_live_mb.unwrap_or(megabytes) * 1024 * 1024,
        }
    }
}

/// Result of a ceiling check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Normal,
    Exceeded,
}

/// Owns the device profile and polls allocation counters against the ceiling
#[derive(Debug, Clone)]
pub struct ResourceGovernor {
    profile: DeviceProfile,
    ceiling: MemoryCeiling,
    arena: BufferArena,
}

impl ResourceGovernor {
    pub fn new(profile: DeviceProfile, ceiling: MemoryCeiling) -> Self {
        Self {
            profile,
            ceiling,
            arena: BufferArena::new(),
        }
    }

    /// Probe the device and derive its ceiling
    pub fn probe(settings: &DeviceSettings) -> Self {
        let profile = DeviceProfile::probe(settings);
        let ceiling = MemoryCeiling::for_profile(&profile, settings);
        Self::new(profile, ceiling)
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn ceiling(&self) -> MemoryCeiling {
        self.ceiling
    }

    /// Arena for buffers owned by the coordinating flow
    pub fn arena(&self) -> &BufferArena {
        &self.arena
    }

    pub fn check(&self) -> MemoryPressure {
        self.check_snapshot(self.arena.snapshot())
    }

    /// Compare an externally gathered snapshot (e.g. pool-wide) with the ceiling
    pub fn check_snapshot(&self, snapshot: MemorySnapshot) -> MemoryPressure {
        if snapshot.live_buffers > self.ceiling.max_buffers || snapshot.live_bytes > self.ceiling.max_bytes {
            warn!(
                "Memory ceiling exceeded: {} buffers / {} bytes (limit {} / {})",
                snapshot.live_buffers, snapshot.live_bytes, self.ceiling.max_buffers, self.ceiling.max_bytes
            );
            MemoryPressure::Exceeded
        } else {
            MemoryPressure::Normal
        }
    }

    /// Log arena counters on a fixed interval until the handle is dropped
    pub fn spawn_monitor(&self, interval: Duration) -> MonitorHandle {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let arena = self.arena.clone();

        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let s = arena.snapshot();
                    info!(
                        "Memory usage: live_buffers={}, live_bytes={}, peak_bytes={}",
                        s.live_buffers, s.live_bytes, s.peak_bytes
                    );
                }
                _ => break,
            }
        });

        MonitorHandle {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }
}

/// Stops the memory monitor thread on drop
pub struct MonitorHandle {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn settings() -> DeviceSettings {
        DeviceSettings::default()
    }

    #[test]
    fn test_profile_batch_sizes() {
        let constrained = DeviceProfile::for_capabilities(true, 4, &settings());
        let desktop = DeviceProfile::for_capabilities(false, 8, &settings());

        assert_eq!(constrained.batch_size, 4);
        assert_eq!(desktop.batch_size, 16);
        assert!(constrained.max_dimension < desktop.max_dimension);
    }

    #[test]
    fn test_forced_constrained_probe() {
        let mut s = settings();
        s.force_constrained = Some(true);
        let profile = DeviceProfile::probe(&s);
        assert!(profile.is_constrained);
        assert_eq!(profile.batch_size, s.constrained_batch_size);
    }

    #[test]
    fn test_fit_dimensions() {
        let mut s = settings();
        s.max_dimension = Some(1000);
        let profile = DeviceProfile::for_capabilities(false, 4, &s);

        assert_eq!(profile.fit_dimensions(800, 600), (800, 600));
        assert_eq!(profile.fit_dimensions(4000, 2000), (1000, 500));
        assert_eq!(profile.fit_dimensions(1500, 3000), (500, 1000));
    }

    #[test]
    fn test_tracked_release_on_drop() {
        let arena = BufferArena::new();
        {
            let a = arena.track(vec![0u8; 100]);
            let b = arena.track(Array2::<f32>::zeros((4, 4)));
            assert_eq!(a.tracked_bytes(), 100);
            assert_eq!(b.tracked_bytes(), 64);

            let s = arena.snapshot();
            assert_eq!(s.live_buffers, 2);
            assert_eq!(s.live_bytes, 164);
        }
        let s = arena.snapshot();
        assert_eq!(s.live_buffers, 0);
        assert_eq!(s.live_bytes, 0);
        assert_eq!(s.peak_bytes, 164);
        assert_eq!(s.total_allocations, 2);
    }

    #[test]
    fn test_release_on_error_path() {
        fn work(arena: &BufferArena, fail: bool) -> Result<usize, String> {
            let buffer = arena.track(vec![1.0f32; 32]);
            if fail {
                return Err("failed mid-way".into());
            }
            Ok(buffer.len())
        }

        let arena = BufferArena::new();
        assert!(work(&arena, true).is_err());
        assert_eq!(work(&arena, false), Ok(32));
        assert_eq!(arena.snapshot().live_buffers, 0);
    }

    #[test]
    fn test_into_inner_transfers_ownership() {
        let arena = BufferArena::new();
        let tracked = arena.track(vec![0u8; 10]);
        let raw = tracked.into_inner();
        assert_eq!(raw.len(), 10);
        assert_eq!(arena.snapshot().live_buffers, 0);
    }

    #[test]
    fn test_scope_outstanding() {
        let arena = BufferArena::new();
        let _outer = arena.track(vec![0u8; 4]);
        let scope = arena.scope("unit");
        let inner = arena.track(vec![0u8; 4]);
        assert_eq!(scope.outstanding(), 1);
        drop(inner);
        assert_eq!(scope.outstanding(), 0);
    }

    #[test]
    fn test_ceiling_check() {
        let profile = DeviceProfile::for_capabilities(true, 2, &settings());
        let governor = ResourceGovernor::new(profile, MemoryCeiling { max_buffers: 2, max_bytes: 1024 });

        let _a = governor.arena().track(vec![0u8; 10]);
        assert_eq!(governor.check(), MemoryPressure::Normal);

        let _b = governor.arena().track(vec![0u8; 10]);
        let _c = governor.arena().track(vec![0u8; 10]);
        assert_eq!(governor.check(), MemoryPressure::Exceeded);

        let big = MemorySnapshot { live_buffers: 1, live_bytes: 4096, ..Default::default() };
        assert_eq!(governor.check_snapshot(big), MemoryPressure::Exceeded);
    }

    #[test]
    fn test_snapshot_merge() {
        let a = MemorySnapshot { live_buffers: 1, live_bytes: 10, peak_bytes: 20, total_allocations: 3 };
        let b = MemorySnapshot { live_buffers: 2, live_bytes: 5, peak_bytes: 5, total_allocations: 1 };
        let merged = a.merge(b);
        assert_eq!(merged.live_buffers, 3);
        assert_eq!(merged.live_bytes, 15);
        assert_eq!(merged.total_allocations, 4);
    }

    #[test]
    fn test_monitor_stops_on_drop() {
        let governor = ResourceGovernor::new(
            DeviceProfile::for_capabilities(false, 4, &settings()),
            MemoryCeiling { max_buffers: 10, max_bytes: 10 },
        );
        let monitor = governor.spawn_monitor(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));
        drop(monitor);
    }
}
