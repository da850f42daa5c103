//! Implements HID devices driven by an element tree.

use std::{
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Instant,
};

use futures::{FutureExt, channel::oneshot, select};
use tracing::{debug, trace, warn};

use crate::{
    caps::{CapabilitySource, ReportType},
    element::Cookie,
    event::{DeviceEvent, EventEmitter},
    router::{ElementState, RouteError, lock},
    store::{ElementValue, ValueStoreHandle},
    subscription::{EventQueue, SubscriptionError},
    transaction::{self, TxError},
    transport::ReportTransport,
    tree::{BuildError, ElementTree},
};

/// Represents a single HID device connected through a [`ReportTransport`].
///
/// The device owns the element tree of the device and the element lock
/// serializing every access to it. Input reports can either be routed by hand
/// via [`Self::route`] or by a reader thread started with [`Self::start`].
pub struct HidDevice<T: ReportTransport> {
    /// The underlying transport.
    transport: Arc<T>,

    /// The element tree and subscriptions, guarded by the element lock.
    state: Arc<Mutex<ElementState>>,

    /// A read-only view of the value store.
    store: ValueStoreHandle,

    /// Emits device-wide events.
    emitter: Arc<EventEmitter<DeviceEvent>>,

    /// The reference point of all timestamps.
    epoch: Instant,

    /// The running reader thread, if any.
    reader: Mutex<Option<ReaderThread>>,
}

struct ReaderThread {
    /// The sender signaling the reader thread to stop.
    close: oneshot::Sender<()>,

    /// The handle to the reader thread. Should be joined after signaling
    /// [`Self::close`].
    handle: JoinHandle<()>,
}

impl<T: ReportTransport> Drop for HidDevice<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<T: ReportTransport> HidDevice<T> {
    /// Builds the element tree of a device out of its capabilities.
    ///
    /// The device starts out not ready for input reports.
    pub fn new<S: CapabilitySource + ?Sized>(transport: T, source: &S) -> Result<Self, BuildError> {
        let tree = ElementTree::build(source)?;
        let store = tree.value_store_handle();

        Ok(Self {
            transport: Arc::new(transport),
            state: Arc::new(Mutex::new(ElementState::new(tree))),
            store,
            emitter: Arc::new(EventEmitter::new()),
            epoch: Instant::now(),
            reader: Mutex::new(None),
        })
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Runs a closure with shared access to the element tree.
    ///
    /// The element lock is held while the closure runs.
    pub fn with_tree<R>(&self, f: impl FnOnce(&ElementTree) -> R) -> R {
        f(lock(&self.state).tree())
    }

    /// Returns a read-only handle to the value store.
    pub fn value_store_handle(&self) -> ValueStoreHandle {
        self.store.clone()
    }

    /// Creates a receiver for device-wide events.
    pub fn listen(&self) -> flume::Receiver<DeviceEvent> {
        self.emitter.create_receiver()
    }

    /// Whether input reports are routed.
    pub fn is_ready(&self) -> bool {
        lock(&self.state).is_ready()
    }

    /// Enables or disables routing of input reports without touching the
    /// reader thread.
    pub fn set_ready(&self, ready: bool) {
        lock(&self.state).set_ready(ready);
    }

    /// The current time in nanoseconds since the device was created.
    pub fn timestamp(&self) -> u64 {
        nanos_since(self.epoch)
    }

    /// Marks the device ready and spawns a thread routing every input report
    /// the transport delivers.
    ///
    /// Does nothing but marking the device ready if the thread already runs.
    pub fn start(&self) {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);

        let buf_len = {
            let mut guard = lock(&self.state);
            guard.set_ready(true);
            guard.tree().max_report_bytes().max(1)
        };

        if reader.is_some() {
            return;
        }

        let (close_sender, mut close_receiver) = oneshot::channel::<()>();

        let handle = thread::spawn({
            let transport = Arc::clone(&self.transport);
            let state = Arc::clone(&self.state);
            let emitter = Arc::clone(&self.emitter);
            let epoch = self.epoch;

            move || {
                futures::executor::block_on(async {
                    let mut buf = vec![0u8; buf_len];

                    loop {
                        let res = select! {
                            _ = close_receiver => {
                                break;
                            },
                            res = transport.read_report(&mut buf).fuse() => res
                        };

                        let len = match res {
                            Ok(len) => len,
                            Err(err) => {
                                warn!("could not read input report: {err}");
                                continue;
                            },
                        };

                        let report = &buf[..len.min(buf.len())];
                        if let Err(err) =
                            deliver(&state, &emitter, report, ReportType::Input, nanos_since(epoch))
                        {
                            trace!("dropped input report: {err}");
                        }
                    }
                });
            }
        });

        debug!("started reader thread");
        *reader = Some(ReaderThread {
            close: close_sender,
            handle,
        });
    }

    /// Marks the device not ready and stops the reader thread, if any.
    pub fn stop(&self) {
        lock(&self.state).set_ready(false);

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(reader) = reader {
            // This only fails if the reader thread already stopped.
            let _ = reader.close.send(());

            if reader.handle.join().is_err() {
                warn!("reader thread panicked");
            }
            debug!("stopped reader thread");
        }
    }

    /// Routes a report to the elements it carries.
    ///
    /// Returns whether any element value changed. Emits
    /// [`DeviceEvent::Activity`] if so.
    pub fn route(&self, report: &[u8], report_type: ReportType) -> Result<bool, RouteError> {
        deliver(&self.state, &self.emitter, report, report_type, self.timestamp())
    }

    /// Refreshes the values of the given elements by requesting their reports
    /// from the device.
    ///
    /// Collections and unknown cookies are skipped. Returns
    /// [`TxError::NotFound`] if no cookie refers to a data element.
    pub async fn update_element_values(&self, cookies: &[Cookie]) -> Result<(), TxError> {
        let epoch = self.epoch;
        transaction::update_element_values(&self.state, &*self.transport, cookies, move || {
            nanos_since(epoch)
        })
        .await
    }

    /// Sends the current values of the given elements to the device.
    ///
    /// Every report touched by one of the elements is sent once, carrying the
    /// values of all of its elements.
    pub async fn post_element_values(&self, cookies: &[Cookie]) -> Result<(), TxError> {
        transaction::post_element_values(&self.state, &*self.transport, cookies).await
    }

    /// Stages a value on a data element, to be sent by a following
    /// [`Self::post_element_values`].
    ///
    /// The value is truncated to the element's bit width.
    pub fn set_element_value(&self, cookie: Cookie, value: i64) -> Result<(), TxError> {
        let timestamp = self.timestamp();
        let mut guard = lock(&self.state);

        if !guard.tree.is_data(cookie) {
            return Err(TxError::NotFound);
        }
        guard.tree.stage(cookie, value, timestamp);

        Ok(())
    }

    /// Returns the cached value of a data element.
    pub fn element_value(&self, cookie: Cookie) -> Option<ElementValue> {
        let guard = lock(&self.state);
        guard.tree.data_element(cookie).map(|element| ElementValue {
            cookie,
            timestamp: element.timestamp(),
            value: element.raw_value().to_vec(),
        })
    }

    /// Returns the cached value of a data element as a logical number.
    pub fn logical_value(&self, cookie: Cookie) -> Option<i64> {
        lock(&self.state)
            .tree
            .data_element(cookie)
            .map(|element| element.logical_value())
    }

    /// Delivers every value change of a data element to a queue.
    pub fn subscribe(&self, cookie: Cookie, queue: &EventQueue) -> Result<(), SubscriptionError> {
        let mut guard = lock(&self.state);
        if !guard.tree.is_data(cookie) {
            return Err(SubscriptionError::BadArgument);
        }

        guard.subscriptions.subscribe(cookie, queue);
        Ok(())
    }

    /// Stops delivering value changes of a data element to a queue.
    ///
    /// [`Cookie::ROOT`] removes the queue from every element.
    pub fn unsubscribe(&self, cookie: Cookie, queue: &EventQueue) -> Result<(), SubscriptionError> {
        let mut guard = lock(&self.state);
        if cookie == Cookie::ROOT {
            guard.subscriptions.unsubscribe_all(queue);
            return Ok(());
        }

        if !guard.tree.is_data(cookie) {
            return Err(SubscriptionError::BadArgument);
        }

        guard.subscriptions.unsubscribe(cookie, queue);
        Ok(())
    }

    /// Checks whether a queue receives the value changes of an element.
    pub fn is_subscribed(&self, cookie: Cookie, queue: &EventQueue) -> bool {
        lock(&self.state).subscriptions.is_subscribed(cookie, queue)
    }
}

/// Routes a report and emits an activity event if any value changed.
fn deliver(
    state: &Mutex<ElementState>,
    emitter: &EventEmitter<DeviceEvent>,
    report: &[u8],
    report_type: ReportType,
    timestamp: u64,
) -> Result<bool, RouteError> {
    let (changed, report_id) = {
        let mut guard = lock(state);
        let changed = guard.route(report, report_type, timestamp)?;
        (changed, guard.tree().report_id_of(report))
    };

    if changed {
        emitter.emit(DeviceEvent::Activity {
            report_type,
            report_id,
        });
    }

    Ok(changed)
}

fn nanos_since(epoch: Instant) -> u64 {
    epoch.elapsed().as_nanos() as u64
}
