//! Emulated accelerator runtime: streams, events, and a pinned host pool.
//!
//! Collectives run on the host, so accelerator-resident tensors stage
//! through pinned shadows on side streams. This module provides the runtime
//! those staging paths program against: per-device ordered streams with a
//! high-priority side pool, one-shot events for cross-stream ordering, a
//! per-thread current stream, and storage pinning against in-flight work.
//!
//! Device ordinals materialize lazily on first touch.

mod pinned;
mod stream;

pub use pinned::{PinnedBuf, PinnedPool};
pub use stream::{Event, Stream};

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Streams per device in the high-priority side pool.
const STREAM_POOL_SIZE: usize = 8;

struct DeviceStreams {
    default: Stream,
    pool: Vec<Stream>,
    next: AtomicUsize,
}

impl DeviceStreams {
    fn new(device: u32) -> Self {
        Self {
            default: Stream::spawn(device, 0),
            pool: (0..STREAM_POOL_SIZE)
                .map(|i| Stream::spawn(device, 1 + i as u32))
                .collect(),
            next: AtomicUsize::new(0),
        }
    }
}

struct AccelRuntime {
    devices: Mutex<Vec<Arc<DeviceStreams>>>,
    pinned: Arc<PinnedPool>,
}

fn runtime() -> &'static AccelRuntime {
    static RUNTIME: OnceLock<AccelRuntime> = OnceLock::new();
    RUNTIME.get_or_init(|| AccelRuntime {
        devices: Mutex::new(Vec::new()),
        pinned: PinnedPool::new(),
    })
}

fn device_streams(device: u32) -> Arc<DeviceStreams> {
    let mut devices = runtime()
        .devices
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    while devices.len() <= device as usize {
        let ordinal = devices.len() as u32;
        devices.push(Arc::new(DeviceStreams::new(ordinal)));
    }
    Arc::clone(&devices[device as usize])
}

thread_local! {
    static CURRENT: RefCell<HashMap<u32, Stream>> = RefCell::new(HashMap::new());
}

/// The calling thread's current stream for `device` (the device's default
/// stream unless overridden with [`set_current_stream`]).
pub fn current_stream(device: u32) -> Stream {
    CURRENT.with(|c| {
        c.borrow()
            .get(&device)
            .cloned()
            .unwrap_or_else(|| device_streams(device).default.clone())
    })
}

/// Override the calling thread's current stream for the stream's device.
/// Restored when the guard drops.
pub fn set_current_stream(stream: &Stream) -> CurrentStreamGuard {
    let device = stream.device();
    let prev = CURRENT.with(|c| c.borrow_mut().insert(device, stream.clone()));
    CurrentStreamGuard { device, prev }
}

pub struct CurrentStreamGuard {
    device: u32,
    prev: Option<Stream>,
}

impl Drop for CurrentStreamGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            let mut map = c.borrow_mut();
            match self.prev.take() {
                Some(s) => {
                    map.insert(self.device, s);
                }
                None => {
                    map.remove(&self.device);
                }
            }
        });
    }
}

/// A stream from the device's high-priority side pool, round-robin.
///
/// Staging uses these so the caller's current stream is never occupied by
/// collective traffic.
pub fn stream_from_pool(device: u32) -> Stream {
    let streams = device_streams(device);
    let i = streams.next.fetch_add(1, Ordering::Relaxed) % streams.pool.len();
    streams.pool[i].clone()
}

/// Block the host until every stream on `device` has drained.
pub fn synchronize_device(device: u32) {
    let streams = device_streams(device);
    streams.default.synchronize();
    for s in &streams.pool {
        s.synchronize();
    }
}

/// Block the host until every stream on every materialized device has
/// drained.
pub fn synchronize_all() {
    let devices: Vec<Arc<DeviceStreams>> = runtime()
        .devices
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for streams in devices {
        streams.default.synchronize();
        for s in &streams.pool {
            s.synchronize();
        }
    }
}

/// Shared pinned-host buffer pool for staging shadows.
pub(crate) fn pinned_pool() -> Arc<PinnedPool> {
    Arc::clone(&runtime().pinned)
}
