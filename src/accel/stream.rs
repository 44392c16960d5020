use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;

type StreamOp = Box<dyn FnOnce() + Send + 'static>;

/// An ordered execution stream on an emulated accelerator device.
///
/// Every operation enqueued on a stream runs on a dedicated thread, in
/// submission order. Cross-stream ordering is expressed with [`Event`]s:
/// record an event on the producing stream, then have the consuming stream
/// wait on it.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    device: u32,
    id: u32,
    ops: mpsc::Sender<StreamOp>,
}

impl Stream {
    pub(crate) fn spawn(device: u32, id: u32) -> Stream {
        let (tx, rx) = mpsc::channel::<StreamOp>();
        thread::Builder::new()
            .name(format!("accel-d{device}-s{id}"))
            .spawn(move || {
                for op in rx {
                    op();
                }
            })
            .expect("failed to spawn stream thread");
        Stream {
            inner: Arc::new(StreamInner {
                device,
                id,
                ops: tx,
            }),
        }
    }

    pub fn device(&self) -> u32 {
        self.inner.device
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Enqueue an operation. Returns immediately; the op runs after all
    /// previously enqueued ops.
    pub fn enqueue(&self, op: impl FnOnce() + Send + 'static) {
        // The receiver lives for the process lifetime, so send cannot fail
        // outside of teardown races; ops lost at exit are harmless.
        let _ = self.inner.ops.send(Box::new(op));
    }

    /// Record an event that fires once the stream drains past this point.
    pub fn record_event(&self) -> Event {
        let event = Event::new();
        let handle = event.clone();
        self.enqueue(move || handle.set());
        event
    }

    /// Order this stream after `event`: ops enqueued later do not run until
    /// the event has fired. The host is not blocked.
    pub fn wait_event(&self, event: &Event) {
        let handle = event.clone();
        self.enqueue(move || handle.wait());
    }

    /// Block the host until every op enqueued so far has run.
    pub fn synchronize(&self) {
        self.record_event().wait();
    }

    /// Tie `token`'s lifetime to the stream's progress: it is dropped only
    /// after the stream drains past this point. Used to pin tensor storage
    /// referenced by in-flight async copies.
    pub fn keep_alive(&self, token: impl Send + 'static) {
        self.enqueue(move || drop(token));
    }
}

impl PartialEq for Stream {
    fn eq(&self, other: &Self) -> bool {
        self.inner.device == other.inner.device && self.inner.id == other.inner.id
    }
}

impl Eq for Stream {}

/// One-shot completion latch connecting streams to each other and to the
/// host.
#[derive(Clone)]
pub struct Event {
    state: Arc<EventState>,
}

struct EventState {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl Event {
    pub fn new() -> Event {
        Event {
            state: Arc::new(EventState {
                fired: Mutex::new(false),
                cv: Condvar::new(),
            }),
        }
    }

    pub(crate) fn set(&self) {
        let mut fired = self
            .state
            .fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *fired = true;
        self.state.cv.notify_all();
    }

    /// Block until the event fires.
    pub fn wait(&self) {
        let mut fired = self
            .state
            .fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*fired {
            fired = self
                .state
                .cv
                .wait(fired)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking completion check.
    pub fn query(&self) -> bool {
        *self
            .state
            .fired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ops_run_in_order() {
        let stream = Stream::spawn(0, 100);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = Arc::clone(&log);
            stream.enqueue(move || log.lock().unwrap().push(i));
        }
        stream.synchronize();
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_event_orders_two_streams() {
        let a = Stream::spawn(0, 101);
        let b = Stream::spawn(0, 102);
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        a.enqueue(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            c.store(1, Ordering::SeqCst);
        });
        let event = a.record_event();

        b.wait_event(&event);
        let c = Arc::clone(&counter);
        let observed = Arc::new(AtomicUsize::new(0));
        let o = Arc::clone(&observed);
        b.enqueue(move || o.store(c.load(Ordering::SeqCst), Ordering::SeqCst));
        b.synchronize();

        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_query() {
        let stream = Stream::spawn(0, 103);
        let event = stream.record_event();
        event.wait();
        assert!(event.query());
    }

    #[test]
    fn test_keep_alive_drops_after_drain() {
        struct Flag(Arc<AtomicUsize>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let stream = Stream::spawn(0, 104);
        let drops = Arc::new(AtomicUsize::new(0));
        stream.keep_alive(Flag(Arc::clone(&drops)));
        stream.synchronize();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
