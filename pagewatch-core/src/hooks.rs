//! Global fault hooks
//!
//! A page exposes a single global error slot, a single unhandled-rejection
//! slot, and listener lists for resource errors, network failures and scroll
//! events. [`HostHooks`] models those slots explicitly; the host dispatches
//! into them and the monitor installs its handlers through a
//! [`HookRegistration`].
//!
//! The registration remembers whichever handler occupied each slot before it,
//! calls that handler after local processing, and puts it back on uninstall.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::capture::{
    NetworkErrorEvent, RejectionEvent, ResourceErrorEvent, ScriptErrorEvent, Signal,
};
use crate::error::contain_panic;

/// Handler in a single-slot hook. Returns `true` when the event was handled
/// and the host's default reporting should be suppressed.
pub type Handler<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Subscriber on a listener list
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A slot holding at most one handler.
pub struct HookSlot<E> {
    current: Mutex<Option<Handler<E>>>,
}

impl<E> Default for HookSlot<E> {
    fn default() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }
}

impl<E> HookSlot<E> {
    pub fn get(&self) -> Option<Handler<E>> {
        self.current.lock().clone()
    }

    /// Replace the handler, returning the previous one.
    pub fn set(&self, handler: Option<Handler<E>>) -> Option<Handler<E>> {
        std::mem::replace(&mut *self.current.lock(), handler)
    }

    pub fn is_set(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Invoke the installed handler, if any.
    pub fn dispatch(&self, event: &E) -> bool {
        // Clone out of the lock so the handler may touch the slot.
        match self.get() {
            Some(handler) => handler(event),
            None => false,
        }
    }
}

/// Identifies a listener for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An ordered list of listeners, like a DOM event target.
pub struct ListenerList<E> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Listener<E>)>>,
}

impl<E> Default for ListenerList<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<E> ListenerList<E> {
    pub fn add(&self, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    pub fn dispatch(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

/// Scroll position change reported by the page
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollEvent {
    /// Vertical scroll offset in CSS pixels
    pub offset: f64,
}

/// The page's global hook slots.
#[derive(Default)]
pub struct HostHooks {
    pub on_error: HookSlot<ScriptErrorEvent>,
    pub on_unhandled_rejection: HookSlot<RejectionEvent>,
    /// Capturing-phase listeners for element load failures
    pub resource_errors: ListenerList<ResourceErrorEvent>,
    pub network_errors: ListenerList<NetworkErrorEvent>,
    pub scroll: ListenerList<ScrollEvent>,
}

impl HostHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Raise a signal through the slot the host would use for it.
    ///
    /// Signals no hook carries (blank-screen, custom) are handed back.
    pub fn raise(&self, signal: Signal) -> Option<Signal> {
        match signal {
            Signal::ScriptError(event) => {
                self.on_error.dispatch(&event);
            }
            Signal::RejectedPromise(event) => {
                self.on_unhandled_rejection.dispatch(&event);
            }
            Signal::ResourceError(event) => self.resource_errors.dispatch(&event),
            Signal::NetworkError(event) => self.network_errors.dispatch(&event),
            other @ (Signal::BlankScreen(_) | Signal::Custom(_)) => return Some(other),
        }
        None
    }
}

/// Receives every signal raised through an installed registration
pub type SignalSink = Arc<dyn Fn(Signal) + Send + Sync>;

fn same_handler<E>(a: &Handler<E>, b: &Handler<E>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Handlers installed into [`HostHooks`], restored on uninstall or drop.
pub struct HookRegistration {
    hooks: Arc<HostHooks>,
    error_handler: Handler<ScriptErrorEvent>,
    previous_error: Option<Handler<ScriptErrorEvent>>,
    rejection_handler: Handler<RejectionEvent>,
    previous_rejection: Option<Handler<RejectionEvent>>,
    resource_listener: ListenerId,
    network_listener: ListenerId,
    installed: bool,
}

impl HookRegistration {
    /// Install handlers that forward every fault to `sink`, then chain to any
    /// handler that was already in the slot.
    pub fn install(hooks: Arc<HostHooks>, sink: SignalSink) -> Self {
        let previous_error = hooks.on_error.get();
        let chained = previous_error.clone();
        let error_sink = sink.clone();
        let error_handler: Handler<ScriptErrorEvent> = Arc::new(move |event: &ScriptErrorEvent| {
            contain_panic("script error hook", || {
                error_sink(Signal::ScriptError(event.clone()))
            });
            chained.as_ref().map(|prev| prev(event)).unwrap_or(false)
        });
        hooks.on_error.set(Some(error_handler.clone()));

        let previous_rejection = hooks.on_unhandled_rejection.get();
        let chained = previous_rejection.clone();
        let rejection_sink = sink.clone();
        let rejection_handler: Handler<RejectionEvent> = Arc::new(move |event: &RejectionEvent| {
            contain_panic("rejection hook", || {
                rejection_sink(Signal::RejectedPromise(event.clone()))
            });
            chained.as_ref().map(|prev| prev(event)).unwrap_or(false)
        });
        hooks
            .on_unhandled_rejection
            .set(Some(rejection_handler.clone()));

        let resource_sink = sink.clone();
        let resource_listener: Listener<ResourceErrorEvent> =
            Arc::new(move |event: &ResourceErrorEvent| {
                contain_panic("resource error listener", || {
                    resource_sink(Signal::ResourceError(event.clone()))
                });
            });
        let resource_listener = hooks.resource_errors.add(resource_listener);

        let network_listener: Listener<NetworkErrorEvent> =
            Arc::new(move |event: &NetworkErrorEvent| {
                contain_panic("network error listener", || {
                    sink(Signal::NetworkError(event.clone()))
                });
            });
        let network_listener = hooks.network_errors.add(network_listener);

        tracing::debug!(
            chained_error = previous_error.is_some(),
            chained_rejection = previous_rejection.is_some(),
            "Installed global fault hooks"
        );

        Self {
            hooks,
            error_handler,
            previous_error,
            rejection_handler,
            previous_rejection,
            resource_listener,
            network_listener,
            installed: true,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    /// Remove our handlers and put the previous ones back.
    pub fn uninstall(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if !self.installed {
            return;
        }
        self.installed = false;

        // Only restore a slot we still own; someone may have chained over us.
        match self.hooks.on_error.get() {
            Some(current) if same_handler(&current, &self.error_handler) => {
                self.hooks.on_error.set(self.previous_error.take());
            }
            _ => tracing::warn!("Global error slot was replaced by other code; leaving it"),
        }
        match self.hooks.on_unhandled_rejection.get() {
            Some(current) if same_handler(&current, &self.rejection_handler) => {
                self.hooks
                    .on_unhandled_rejection
                    .set(self.previous_rejection.take());
            }
            _ => tracing::warn!("Rejection slot was replaced by other code; leaving it"),
        }
        self.hooks.resource_errors.remove(self.resource_listener);
        self.hooks.network_errors.remove(self.network_listener);

        tracing::debug!("Restored global fault hooks");
    }
}

impl Drop for HookRegistration {
    fn drop(&mut self) {
        self.restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;
    use std::sync::atomic::AtomicUsize;

    fn collecting_sink() -> (SignalSink, Arc<Mutex<Vec<ErrorKind>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_sink = seen.clone();
        let sink: SignalSink = Arc::new(move |signal: Signal| {
            seen_in_sink.lock().push(signal.kind());
        });
        (sink, seen)
    }

    #[test]
    fn test_install_captures_each_hook() {
        let hooks = HostHooks::new();
        let (sink, seen) = collecting_sink();
        let _registration = HookRegistration::install(hooks.clone(), sink);

        hooks.on_error.dispatch(&ScriptErrorEvent::default());
        hooks
            .on_unhandled_rejection
            .dispatch(&RejectionEvent::default());
        hooks.resource_errors.dispatch(&ResourceErrorEvent {
            tag_name: "img".to_string(),
            src: None,
        });
        hooks.network_errors.dispatch(&NetworkErrorEvent {
            url: "https://api.example.com".to_string(),
            method: "GET".to_string(),
            status: None,
            status_text: None,
            duration_ms: None,
        });

        assert_eq!(
            *seen.lock(),
            vec![
                ErrorKind::ScriptError,
                ErrorKind::RejectedPromise,
                ErrorKind::ResourceError,
                ErrorKind::NetworkError,
            ]
        );
    }

    #[test]
    fn test_previous_handler_is_chained_and_restored() {
        let hooks = HostHooks::new();
        let previous_calls = Arc::new(AtomicUsize::new(0));
        let counter = previous_calls.clone();
        let previous: Handler<ScriptErrorEvent> = Arc::new(move |_: &ScriptErrorEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        hooks.on_error.set(Some(previous.clone()));

        let (sink, seen) = collecting_sink();
        let registration = HookRegistration::install(hooks.clone(), sink);

        // Our handler reports and forwards the previous handler's verdict.
        assert!(hooks.on_error.dispatch(&ScriptErrorEvent::default()));
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(previous_calls.load(Ordering::SeqCst), 1);

        registration.uninstall();

        let restored = hooks.on_error.get().unwrap();
        assert!(same_handler(&restored, &previous));
        assert!(!hooks.on_unhandled_rejection.is_set());
        assert!(hooks.resource_errors.is_empty());
        assert!(hooks.network_errors.is_empty());
    }

    #[test]
    fn test_drop_restores_slots() {
        let hooks = HostHooks::new();
        let (sink, _) = collecting_sink();
        {
            let _registration = HookRegistration::install(hooks.clone(), sink);
            assert!(hooks.on_error.is_set());
        }
        assert!(!hooks.on_error.is_set());
    }

    #[test]
    fn test_restore_leaves_foreign_replacement_alone() {
        let hooks = HostHooks::new();
        let (sink, _) = collecting_sink();
        let registration = HookRegistration::install(hooks.clone(), sink);

        let foreign: Handler<ScriptErrorEvent> = Arc::new(|_: &ScriptErrorEvent| false);
        hooks.on_error.set(Some(foreign.clone()));
        registration.uninstall();

        assert!(same_handler(&hooks.on_error.get().unwrap(), &foreign));
    }

    #[test]
    fn test_panicking_sink_still_chains() {
        let hooks = HostHooks::new();
        let previous_calls = Arc::new(AtomicUsize::new(0));
        let counter = previous_calls.clone();
        hooks.on_error.set(Some(Arc::new(move |_: &ScriptErrorEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        })));

        let sink: SignalSink = Arc::new(|_: Signal| panic!("pipeline bug"));
        let _registration = HookRegistration::install(hooks.clone(), sink);

        hooks.on_error.dispatch(&ScriptErrorEvent::default());
        assert_eq!(previous_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_raise_routes_by_kind() {
        let hooks = HostHooks::new();
        let (sink, seen) = collecting_sink();
        let _registration = HookRegistration::install(hooks.clone(), sink);

        assert!(hooks
            .raise(Signal::ScriptError(ScriptErrorEvent::default()))
            .is_none());
        let custom = hooks.raise(Signal::Custom(crate::capture::CustomError::new("manual")));

        assert_eq!(*seen.lock(), vec![ErrorKind::ScriptError]);
        assert_eq!(custom.map(|s| s.kind()), Some(ErrorKind::Custom));
    }

    #[test]
    fn test_listener_removal() {
        let list: ListenerList<ScrollEvent> = ListenerList::default();
        let id = list.add(Arc::new(|_: &ScrollEvent| {}));
        assert_eq!(list.len(), 1);
        assert!(list.remove(id));
        assert!(!list.remove(id));
    }
}
