use std::borrow::Cow;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use indexmap::{IndexMap, IndexSet};

use tracing::{error, trace};

use crate::{lock, panic_message};

/// A callback receiving the sender and the data of a signal.
///
/// Two callbacks are the same callback when one is a clone of the other.
pub struct Callback<S, D> {
    function: Arc<dyn Fn(&S, &D) + Send + Sync>,
}

impl<S, D> Callback<S, D> {
    /// Creates a [`Callback`].
    #[must_use]
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(&S, &D) + Send + Sync + 'static,
    {
        Self {
            function: Arc::new(function),
        }
    }

    fn address(&self) -> *const () {
        Arc::as_ptr(&self.function).cast::<()>()
    }
}

impl<S, D> Clone for Callback<S, D> {
    fn clone(&self) -> Self {
        Self {
            function: Arc::clone(&self.function),
        }
    }
}

impl<S, D> PartialEq for Callback<S, D> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.address(), other.address())
    }
}

impl<S, D> Eq for Callback<S, D> {}

impl<S, D> Hash for Callback<S, D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl<S, D> std::fmt::Debug for Callback<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Callback").field(&self.address()).finish()
    }
}

struct Registration<S, D> {
    callback: Callback<S, D>,
    sender: Option<S>,
}

impl<S: PartialEq, D> PartialEq for Registration<S, D> {
    fn eq(&self, other: &Self) -> bool {
        self.callback == other.callback && self.sender == other.sender
    }
}

impl<S: Eq, D> Eq for Registration<S, D> {}

impl<S: Hash, D> Hash for Registration<S, D> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.callback.hash(state);
        self.sender.hash(state);
    }
}

impl<S, D> Registration<S, D> {
    fn matches(&self, callback: Option<&Callback<S, D>>, sender: Option<&S>) -> bool
    where
        S: PartialEq,
    {
        callback.is_none_or(|callback| self.callback == *callback)
            && sender.is_none_or(|sender| self.sender.as_ref() == Some(sender))
    }
}

/// A registry of named signals.
///
/// Callbacks register to a signal, optionally only for a given sender, and
/// run in registration order each time the signal is sent.
pub struct SignalBus<S, D> {
    signals: Mutex<IndexMap<Cow<'static, str>, IndexSet<Registration<S, D>>>>,
}

impl<S, D> Default for SignalBus<S, D> {
    fn default() -> Self {
        Self {
            signals: Mutex::new(IndexMap::new()),
        }
    }
}

impl<S, D> SignalBus<S, D>
where
    S: Eq + Hash + Clone + std::fmt::Debug,
{
    /// Creates an empty [`SignalBus`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback to a signal.
    ///
    /// With a sender, the callback only runs for the signals sent by that
    /// sender. Returns `false` if the same callback was already registered
    /// with the same sender.
    pub fn register(
        &self,
        signal: impl Into<Cow<'static, str>>,
        callback: &Callback<S, D>,
        sender: Option<S>,
    ) -> bool {
        lock(&self.signals)
            .entry(signal.into())
            .or_default()
            .insert(Registration {
                callback: callback.clone(),
                sender,
            })
    }

    /// Unregisters callbacks from a signal.
    ///
    /// Without a callback, every registration of the sender is removed;
    /// without a sender, every registration of the callback is removed;
    /// without both, the signal is cleared. Returns the number of removed
    /// registrations.
    pub fn unregister(
        &self,
        signal: &str,
        callback: Option<&Callback<S, D>>,
        sender: Option<&S>,
    ) -> usize {
        let mut signals = lock(&self.signals);
        let Some(registrations) = signals.get_mut(signal) else {
            return 0;
        };

        let before = registrations.len();
        registrations.retain(|registration| !registration.matches(callback, sender));
        let removed = before - registrations.len();

        if registrations.is_empty() {
            let _ = signals.shift_remove(signal);
        }
        removed
    }

    /// Sends a signal.
    ///
    /// Runs, in registration order, every callback registered without a
    /// sender or with the given sender. Callbacks run outside the registry
    /// lock, so they can register and unregister callbacks themselves. A
    /// panicking callback is logged and does not prevent the others from
    /// running.
    ///
    /// Returns the number of callbacks which completed.
    pub fn send(&self, signal: &str, sender: &S, data: &D) -> usize {
        let callbacks: Vec<Callback<S, D>> = lock(&self.signals)
            .get(signal)
            .map(|registrations| {
                registrations
                    .iter()
                    .filter(|registration| {
                        registration
                            .sender
                            .as_ref()
                            .is_none_or(|filter| filter == sender)
                    })
                    .map(|registration| registration.callback.clone())
                    .collect()
            })
            .unwrap_or_default();

        trace!(
            "Sending `{signal}` from {sender:?} to {} callbacks",
            callbacks.len()
        );

        callbacks
            .iter()
            .filter(|callback| {
                panic::catch_unwind(AssertUnwindSafe(|| (callback.function)(sender, data)))
                    .map_err(|panic| {
                        error!(
                            "A callback of `{signal}` panicked: {}",
                            panic_message(panic.as_ref())
                        );
                    })
                    .is_ok()
            })
            .count()
    }

    /// Returns the number of registrations of a signal.
    #[must_use]
    pub fn receivers(&self, signal: &str) -> usize {
        lock(&self.signals).get(signal).map_or(0, IndexSet::len)
    }

    /// Removes every registration of every signal.
    pub fn clear(&self) {
        lock(&self.signals).clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{Callback, SignalBus};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, name: &'static str) -> Callback<u64, i32> {
        let log = Arc::clone(log);
        Callback::new(move |sender: &u64, data: &i32| {
            log.lock().unwrap().push(format!("{name}:{sender}:{data}"));
        })
    }

    #[test]
    fn registration_is_unique_per_sender() {
        let bus = SignalBus::new();
        let log = Log::default();
        let callback = recorder(&log, "a");

        assert!(bus.register("value_changed", &callback, None));
        assert!(!bus.register("value_changed", &callback.clone(), None));
        assert!(bus.register("value_changed", &callback, Some(1)));
        assert_eq!(bus.receivers("value_changed"), 2);

        // A callback with the same behavior is a different callback.
        assert!(bus.register("value_changed", &recorder(&log, "a"), None));
        assert_eq!(bus.receivers("value_changed"), 3);
    }

    #[test]
    fn sender_filters_and_order() {
        let bus = SignalBus::new();
        let log = Log::default();

        let _ = bus.register("value_changed", &recorder(&log, "any"), None);
        let _ = bus.register("value_changed", &recorder(&log, "one"), Some(1));
        let _ = bus.register("value_changed", &recorder(&log, "two"), Some(2));
        let _ = bus.register("node_added", &recorder(&log, "other"), None);

        assert_eq!(bus.send("value_changed", &1, &10), 2);
        assert_eq!(bus.send("value_changed", &3, &30), 1);
        assert_eq!(bus.send("unknown", &1, &0), 0);

        assert_eq!(
            *log.lock().unwrap(),
            ["any:1:10", "one:1:10", "any:3:30"]
        );
    }

    #[test]
    fn unregister() {
        let bus = SignalBus::new();
        let log = Log::default();
        let first = recorder(&log, "first");
        let second = recorder(&log, "second");

        let _ = bus.register("value_changed", &first, None);
        let _ = bus.register("value_changed", &first, Some(1));
        let _ = bus.register("value_changed", &second, Some(1));
        let _ = bus.register("value_changed", &second, Some(2));

        // Every registration of a sender.
        assert_eq!(bus.unregister("value_changed", None, Some(&1)), 2);
        assert_eq!(bus.receivers("value_changed"), 2);

        // Every registration of a callback.
        assert_eq!(bus.unregister("value_changed", Some(&first), None), 1);
        assert_eq!(bus.receivers("value_changed"), 1);

        // A single pair.
        assert_eq!(bus.unregister("value_changed", Some(&second), Some(&1)), 0);
        assert_eq!(bus.unregister("value_changed", Some(&second), Some(&2)), 1);
        assert_eq!(bus.receivers("value_changed"), 0);

        let _ = bus.register("value_changed", &first, None);
        let _ = bus.register("value_changed", &second, None);
        assert_eq!(bus.unregister("value_changed", None, None), 2);
        assert_eq!(bus.unregister("missing", None, None), 0);
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let bus = SignalBus::new();
        let log = Log::default();

        let _ = bus.register(
            "value_changed",
            &Callback::new(|_: &u64, _: &i32| panic!("broken callback")),
            None,
        );
        let _ = bus.register("value_changed", &recorder(&log, "after"), None);

        assert_eq!(bus.send("value_changed", &1, &5), 1);
        assert_eq!(*log.lock().unwrap(), ["after:1:5"]);
    }

    #[test]
    fn callbacks_can_use_the_bus() {
        let bus = Arc::new(SignalBus::<u64, i32>::new());
        let log = Log::default();

        let inner = Arc::clone(&bus);
        let late = recorder(&log, "late");
        let _ = bus.register(
            "value_changed",
            &Callback::new(move |_: &u64, _: &i32| {
                let _ = inner.register("value_changed", &late, None);
            }),
            None,
        );

        assert_eq!(bus.send("value_changed", &1, &1), 1);
        assert_eq!(bus.send("value_changed", &1, &2), 2);
        assert_eq!(*log.lock().unwrap(), ["late:1:2"]);
    }

    #[test]
    fn clear() {
        let bus = SignalBus::new();
        let log = Log::default();

        let _ = bus.register("value_changed", &recorder(&log, "a"), None);
        let _ = bus.register("node_added", &recorder(&log, "b"), None);
        bus.clear();

        assert_eq!(bus.receivers("value_changed"), 0);
        assert_eq!(bus.send("node_added", &1, &1), 0);
    }
}
