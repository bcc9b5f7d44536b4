//! Listener notification fan-out
//!
//! A connection reports state changes, errors, received data, traces and
//! property changes to zero or more registered [`MediaListener`]s. Fan-out
//! for one physical event is dispatched as a single unit through the
//! configured [`NotifyDispatcher`], so listeners observe a consistent
//! ordering relative to other events from the same connection. A panicking
//! listener is isolated and logged; delivery to the remaining listeners
//! still happens.

use crate::error::Error;
use crate::types::{MediaState, TraceLevel, TraceType};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// One chunk of received data, tagged with its sender
#[derive(Debug, Clone)]
pub struct ReceiveEvent {
    pub data: Vec<u8>,
    /// Remote socket address for TCP, `address:port` of the sender for UDP
    pub origin: String,
}

/// One trace notification
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub trace_type: TraceType,
    pub payload: String,
}

/// Observer interface implemented by external collaborators.
///
/// All methods default to no-ops so an implementor only overrides what it
/// cares about. Callbacks may arrive from the connection's receive thread;
/// keep them short or hand the work off.
pub trait MediaListener: Send + Sync {
    fn on_media_state_change(&self, _state: MediaState) {}
    fn on_error(&self, _error: &Error) {}
    fn on_received(&self, _event: &ReceiveEvent) {}
    fn on_trace(&self, _event: &TraceEvent) {}
    fn on_property_changed(&self, _property: &str) {}
}

/// A unit of notification work handed to a dispatcher
pub type NotifyTask = Box<dyn FnOnce() + Send>;

/// Notification context strategy.
///
/// The default [`InlineDispatcher`] delivers on the thread that raised the
/// event. [`ChannelDispatcher`] hands each fan-out to a caller-owned
/// consumer thread instead, for hosts that need delivery affinity.
pub trait NotifyDispatcher: Send + Sync {
    fn dispatch(&self, task: NotifyTask);
}

/// Delivers notifications synchronously on the raising thread
#[derive(Debug, Default)]
pub struct InlineDispatcher;

impl NotifyDispatcher for InlineDispatcher {
    fn dispatch(&self, task: NotifyTask) {
        task();
    }
}

/// Queues whole-event fan-outs on a channel for a caller-owned consumer.
///
/// The consumer drains the returned receiver and runs each task:
///
/// ```no_run
/// use setu_net::listener::ChannelDispatcher;
///
/// let (dispatcher, tasks) = ChannelDispatcher::new();
/// std::thread::spawn(move || {
///     for task in tasks {
///         task();
///     }
/// });
/// # let _ = dispatcher;
/// ```
pub struct ChannelDispatcher {
    tx: crossbeam_channel::Sender<NotifyTask>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, crossbeam_channel::Receiver<NotifyTask>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }
}

impl NotifyDispatcher for ChannelDispatcher {
    fn dispatch(&self, task: NotifyTask) {
        if self.tx.send(task).is_err() {
            log::warn!("Notification dropped: dispatcher consumer is gone");
        }
    }
}

/// De-duplicated, insertion-ordered listener registry
pub struct ListenerHub {
    listeners: RwLock<Vec<Arc<dyn MediaListener>>>,
    dispatcher: RwLock<Arc<dyn NotifyDispatcher>>,
}

impl Default for ListenerHub {
    fn default() -> Self {
        Self::new()
    }
}

fn same_listener(a: &Arc<dyn MediaListener>, b: &Arc<dyn MediaListener>) -> bool {
    // Identity by data pointer; a listener registered twice is the same
    // object regardless of which vtable the Arc was created through.
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl ListenerHub {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            dispatcher: RwLock::new(Arc::new(InlineDispatcher)),
        }
    }

    /// Register a listener. Re-registering the same object is ignored.
    pub fn add_listener(&self, listener: Arc<dyn MediaListener>) {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            log::warn!("Listener already added");
            return;
        }
        listeners.push(listener);
    }

    /// Remove a listener by identity. Unknown listeners are ignored.
    pub fn remove_listener(&self, listener: &Arc<dyn MediaListener>) {
        self.listeners
            .write()
            .retain(|l| !same_listener(l, listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Replace the notification context
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn NotifyDispatcher>) {
        *self.dispatcher.write() = dispatcher;
    }

    /// Run `deliver` for each registered listener, as one dispatched unit
    fn fan_out<F>(&self, what: &'static str, deliver: F)
    where
        F: Fn(&dyn MediaListener) + Send + 'static,
    {
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            return;
        }
        let task: NotifyTask = Box::new(move || {
            for listener in &listeners {
                let result = catch_unwind(AssertUnwindSafe(|| deliver(listener.as_ref())));
                if result.is_err() {
                    log::error!("Listener panicked during {} notification", what);
                }
            }
        });
        self.dispatcher.read().dispatch(task);
    }

    /// Notify a state transition. At trace level `Error` and above an
    /// `Info` trace accompanies the state change, matching the media
    /// contract of the surrounding framework.
    pub fn notify_media_state_change(&self, state: MediaState, trace: TraceLevel) {
        self.fan_out("state change", move |listener| {
            if trace >= TraceLevel::Error {
                listener.on_trace(&TraceEvent {
                    trace_type: TraceType::Info,
                    payload: state.to_string(),
                });
            }
            listener.on_media_state_change(state);
        });
    }

    /// Notify an error raised outside any caller-invoked operation
    pub fn notify_error(&self, error: Error, trace: TraceLevel) {
        let error = Arc::new(error);
        self.fan_out("error", move |listener| {
            listener.on_error(&error);
            if trace >= TraceLevel::Error {
                listener.on_trace(&TraceEvent {
                    trace_type: TraceType::Error,
                    payload: error.to_string(),
                });
            }
        });
    }

    /// Notify asynchronously received data
    pub fn notify_received(&self, event: ReceiveEvent) {
        self.fan_out("receive", move |listener| listener.on_received(&event));
    }

    /// Notify a trace event
    pub fn notify_trace(&self, event: TraceEvent) {
        self.fan_out("trace", move |listener| listener.on_trace(&event));
    }

    /// Notify that a configuration property changed
    pub fn notify_property_changed(&self, property: &str) {
        let property = property.to_string();
        self.fan_out("property change", move |listener| {
            listener.on_property_changed(&property)
        });
    }
}
