use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};

use tracing::{trace, warn};

use crate::dispatcher::{Dispatcher, Owner, WorkResult};
use crate::signals::SignalBus;

/// The signal bus notifications are published on.
pub type EventBus = SignalBus<Owner, Map<String, Value>>;

/// Signal carrying the notifications without a recognized shape.
pub const NOTIFICATION_SIGNAL: &str = "notification";

#[derive(Deserialize)]
struct Event {
    signal: String,
    #[serde(default)]
    object: Option<u64>,
    #[serde(default)]
    data: Map<String, Value>,
}

/// Routes the notifications received by a client to the owners they belong
/// to, publishing them on an [`EventBus`].
///
/// A notification shaped as `{"signal": name, "object": id, "data": {..}}`
/// is handed to the queue of [`Owner::Object`] and published as the `name`
/// signal with that owner as sender. Without an `object` field it is
/// published right away from [`Owner::Network`]. Any other value is published
/// as the [`NOTIFICATION_SIGNAL`] signal from [`Owner::Network`], under the
/// `value` key.
#[derive(Clone)]
pub struct NotificationRouter {
    dispatcher: Dispatcher,
    bus: Arc<EventBus>,
}

impl NotificationRouter {
    /// Creates a [`NotificationRouter`].
    #[must_use]
    pub const fn new(dispatcher: Dispatcher, bus: Arc<EventBus>) -> Self {
        Self { dispatcher, bus }
    }

    /// Returns the notification handler to be given to a client.
    pub fn handler(&self) -> impl Fn(Value) -> WorkResult + Send + Sync + 'static {
        let router = self.clone();
        move |notification| {
            router.route(notification);
            Ok(())
        }
    }

    /// Routes a notification.
    pub fn route(&self, notification: Value) {
        let Ok(Event {
            signal,
            object,
            data,
        }) = Event::deserialize(&notification)
        else {
            trace!("Publishing a notification without a signal");
            let mut data = Map::new();
            let _ = data.insert("value".into(), notification);
            let _ = self.bus.send(NOTIFICATION_SIGNAL, &Owner::Network, &data);
            return;
        };

        let Some(id) = object else {
            let _ = self.bus.send(&signal, &Owner::Network, &data);
            return;
        };

        let owner = Owner::Object(id);
        let bus = Arc::clone(&self.bus);
        if !self.dispatcher.enqueue(owner, move || {
            let _ = bus.send(&signal, &owner, &data);
            Ok(())
        }) {
            warn!("Notification for {owner} dropped");
        }
    }
}
