//! Host/device staging helpers shared by the accelerator job variants.
//!
//! Each tensor (or nested tensor list) gets a side stream from the
//! high-priority pool, ordered after the caller's current stream through a
//! recorded event, with the tensor storage pinned against the side stream
//! so the allocator cannot release it while async copies are in flight.

use crate::accel::{self, Event, Stream};
use crate::tensor::{DenseTensor, Tensor, TensorRepr};
use std::sync::{Arc, Mutex, PoisonError};

fn ordered_side_stream(device: u32) -> Stream {
    let current = accel::current_stream(device);
    let ready = current.record_event();
    let side = accel::stream_from_pool(device);
    side.wait_event(&ready);
    side
}

fn pin_tensor(side: &Stream, tensor: &Tensor) {
    match &tensor.repr {
        TensorRepr::Dense(d) => side.keep_alive(Arc::clone(d.storage())),
        TensorRepr::Sparse(s) => {
            if s.is_coalesced() {
                side.keep_alive(Arc::clone(s.indices().storage()));
                side.keep_alive(Arc::clone(s.values().storage()));
            }
            // Uncoalesced inputs are coalesced on the side stream itself;
            // the tensors that produces already belong to that stream.
        }
    }
}

fn accel_ordinal(tensor: &Tensor) -> u32 {
    tensor
        .device()
        .ordinal()
        .expect("staging requires accelerator tensors")
}

/// One side stream per tensor, ordered after the caller's current stream.
pub(crate) fn init_streams(tensors: &[Tensor]) -> Vec<Stream> {
    tensors
        .iter()
        .map(|t| {
            let side = ordered_side_stream(accel_ordinal(t));
            pin_tensor(&side, t);
            side
        })
        .collect()
}

/// One side stream per nested list. All tensors of a list share a device
/// and are pinned against the list's stream.
pub(crate) fn init_streams_nested(lists: &[Vec<Tensor>]) -> Vec<Stream> {
    lists
        .iter()
        .map(|list| {
            let side = ordered_side_stream(accel_ordinal(&list[0]));
            for t in list {
                pin_tensor(&side, t);
            }
            side
        })
        .collect()
}

/// Enqueue an asynchronous element copy `dst <- src` on `stream`.
pub(crate) fn copy_async(dst: &DenseTensor, src: &DenseTensor, stream: &Stream) {
    let dst = dst.clone();
    let src = src.clone();
    stream.enqueue(move || {
        if let Err(e) = dst.write_bytes(&src.read_bytes()) {
            tracing::warn!(error = %e, "async staging copy failed");
        }
    });
}

/// Completion events recorded by a staged job's copy-backs, keyed by
/// device ordinal.
pub(crate) type CompletionEvents = Mutex<Vec<(u32, Event)>>;

/// Block the caller's current stream on every recorded completion event.
pub(crate) fn block_current_streams(events: &CompletionEvents) {
    let events = events.lock().unwrap_or_else(PoisonError::into_inner);
    for (device, event) in events.iter() {
        accel::current_stream(*device).wait_event(event);
    }
}

/// Record a completion event for `tensor`'s device on `stream`.
pub(crate) fn record_completion(events: &CompletionEvents, tensor: &Tensor, stream: &Stream) {
    events
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push((accel_ordinal(tensor), stream.record_event()));
}
