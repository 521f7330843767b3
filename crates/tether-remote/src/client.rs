use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use hashbrown::HashMap;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use tracing::{debug, error, info, warn};

use tether::cipher::Cipher;
use tether::envelope::{CallEnvelope, CallResult, Payload, ResultEnvelope};
use tether::token::Token;

use crate::channel::ReliableChannel;
use crate::config::RemoteConfig;
use crate::dispatcher::{Dispatcher, Owner, WorkResult};
use crate::error::{Error, ErrorKind, Result};
use crate::link::{self, Link};
use crate::lock;
use crate::surface::PING;

/// The connection state of a [`RemoteClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// The connection has been lost.
    Disconnected,
    /// The connection is being established.
    Connecting,
    /// The connection is established.
    Connected,
    /// The connection is being closed.
    Draining,
    /// The connection is closed.
    Closed,
}

#[derive(Default)]
struct Waiters {
    closed: bool,
    pending: HashMap<Token, flume::Sender<CallResult>>,
}

struct Shared {
    channel: ReliableChannel,
    waiters: Mutex<Waiters>,
    state: Mutex<PeerState>,
    stop: AtomicBool,
}

impl Shared {
    // Releases every waiting caller with a closed channel error.
    fn release_waiters(&self) {
        let released = {
            let mut waiters = lock(&self.waiters);
            waiters.closed = true;
            let released = waiters.pending.len();
            // Dropping the senders wakes up the receivers.
            waiters.pending.clear();
            released
        };
        if released > 0 {
            debug!("Released {released} waiting calls");
        }
    }

    fn set_state(&self, state: PeerState) {
        *lock(&self.state) = state;
    }

    fn update_state(&self, from: &[PeerState], to: PeerState) {
        let mut state = lock(&self.state);
        if from.contains(&*state) {
            *state = to;
        }
    }
}

/// A client connected to a remote server.
///
/// Calls block until their result arrives. Notifications pushed by the
/// server are handed in order to the [`Dispatcher`] under
/// [`Owner::Network`].
///
/// Dropping the client closes it.
pub struct RemoteClient {
    shared: Arc<Shared>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RemoteClient {
    /// Connects to the server described by the configuration.
    ///
    /// Each notification sent by the server runs `handler` on the
    /// [`Owner::Network`] worker of the dispatcher.
    ///
    /// # Errors
    ///
    /// The configuration is invalid, the connection could not be
    /// established, or the client threads could not be started.
    pub fn connect<H>(config: &RemoteConfig, dispatcher: Dispatcher, handler: H) -> Result<Self>
    where
        H: Fn(Value) -> WorkResult + Send + Sync + 'static,
    {
        config.validate()?;
        debug!("Connecting to {}:{}", config.host, config.port);

        let link = link::connect(config)?;
        Self::start(link, config, dispatcher, handler)
    }

    pub(crate) fn start<H>(
        link: Arc<dyn Link>,
        config: &RemoteConfig,
        dispatcher: Dispatcher,
        handler: H,
    ) -> Result<Self>
    where
        H: Fn(Value) -> WorkResult + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            channel: ReliableChannel::new(
                link,
                Cipher::new(&config.password),
                config.timings.retry_after,
            ),
            waiters: Mutex::new(Waiters::default()),
            state: Mutex::new(PeerState::Connecting),
            stop: AtomicBool::new(false),
        });

        let client = Self {
            shared,
            loops: Mutex::new(Vec::new()),
        };

        // On a failed start, the senders are dropped before the client, so
        // that closing it can join the loops already started.
        let (results_tx, results_rx) = flume::unbounded();
        let (notifications_tx, notifications_rx) = flume::unbounded();

        let shared = Arc::clone(&client.shared);
        client.spawn("results", move || run_results(&shared, &results_rx))?;

        let handler = Arc::new(handler);
        client.spawn("notifications", move || {
            for notification in notifications_rx.iter() {
                let handler = Arc::clone(&handler);
                let _ = dispatcher.enqueue(Owner::Network, move || handler(notification));
            }
        })?;

        // The consumer loops end once the reader drops its senders.
        let shared = Arc::clone(&client.shared);
        let tick = config.timings.tick;
        client.spawn("reader", move || {
            let outcome = shared
                .channel
                .run_reader(&shared.stop, tick, |payload| match payload {
                    Payload::Result(result) => {
                        let _ = results_tx.send(result);
                    }
                    Payload::Notification(notification) => {
                        let _ = notifications_tx.send(notification.notification);
                    }
                    Payload::Call(call) => {
                        warn!("Ignoring call to `{}` sent by the server", call.func);
                    }
                });

            match outcome {
                Ok(()) => info!("Connection closed"),
                Err(e) => error!("Connection lost: {e}"),
            }

            shared.channel.teardown();
            shared.release_waiters();
            shared.update_state(
                &[PeerState::Connecting, PeerState::Connected],
                PeerState::Disconnected,
            );
        })?;

        client
            .shared
            .update_state(&[PeerState::Connecting], PeerState::Connected);
        Ok(client)
    }

    fn spawn<F>(&self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("client-{name}"))
            .spawn(body)
            .map_err(|e| {
                Error::new(
                    ErrorKind::Io,
                    format!("Impossible to start the {name} loop: {e}"),
                )
            })?;
        lock(&self.loops).push(handle);
        Ok(())
    }

    /// Returns the connection state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        *lock(&self.shared.state)
    }

    /// Invokes an operation on the server and waits for its result.
    ///
    /// # Errors
    ///
    /// The client is closed or gets closed while waiting, the call could
    /// not be sent, or the operation failed remotely.
    pub fn invoke(&self, func: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        let call = CallEnvelope::new(func, args, kwargs);
        let id = call.id;
        let (result_tx, result_rx) = flume::bounded(1);

        {
            let mut waiters = lock(&self.shared.waiters);
            if waiters.closed {
                return Err(Error::channel_closed());
            }
            let _ = waiters.pending.insert(id, result_tx);
        }

        if let Err(e) = self.shared.channel.send(&Payload::Call(call)) {
            let _ = lock(&self.shared.waiters).pending.remove(&id);
            return Err(e);
        }
        debug!("Invoked `{func}` with call {id}");

        match result_rx.recv() {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::channel_closed()),
        }
    }

    /// Invokes an operation on the server and deserializes its result.
    ///
    /// # Errors
    ///
    /// The invocation failed, or the result has not the expected type.
    pub fn invoke_as<T: DeserializeOwned>(
        &self,
        func: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<T> {
        serde_json::from_value(self.invoke(func, args, kwargs)?).map_err(Error::from)
    }

    /// Invokes an operation with positional arguments only.
    ///
    /// # Errors
    ///
    /// See [`RemoteClient::invoke`].
    pub fn call(&self, func: &str, args: Vec<Value>) -> Result<Value> {
        self.invoke(func, args, Map::new())
    }

    /// Checks that the server answers calls.
    ///
    /// # Errors
    ///
    /// See [`RemoteClient::invoke`].
    pub fn ping(&self) -> Result<()> {
        match self.call(PING, Vec::new())? {
            Value::String(answer) if answer == "pong" => Ok(()),
            answer => Err(Error::new(
                ErrorKind::OperationFailed,
                format!("Unexpected answer to ping: {answer}"),
            )),
        }
    }

    /// Closes the client.
    ///
    /// Every call still waiting for its result fails with a closed channel
    /// error. Closing an already closed client does nothing.
    pub fn close(&self) {
        let loops = std::mem::take(&mut *lock(&self.loops));
        if loops.is_empty() && self.state() == PeerState::Closed {
            return;
        }

        self.shared.set_state(PeerState::Draining);
        self.shared.stop.store(true, Ordering::Release);
        self.shared.channel.teardown();
        self.shared.release_waiters();

        let current = thread::current().id();
        for handle in loops {
            // A loop closing its own client cannot wait for itself.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("A client loop panicked");
            }
        }

        self.shared.set_state(PeerState::Closed);
        info!("Client closed");
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_results(shared: &Shared, results: &flume::Receiver<ResultEnvelope>) {
    for ResultEnvelope { id, result } in results.iter() {
        let waiter = lock(&shared.waiters).pending.remove(&id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => warn!("Discarding result of call {id}: nobody is waiting for it"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use serde_json::{Map, json};

    use tether::cipher::Cipher;
    use tether::envelope::{Body, Payload};

    use crate::channel::tests::MemoryLink;
    use crate::config::RemoteConfig;
    use crate::dispatcher::Dispatcher;
    use crate::error::ErrorKind;

    use super::{PeerState, RemoteClient};

    fn client() -> (RemoteClient, Arc<MemoryLink>) {
        let link = Arc::new(MemoryLink::default());
        let client = RemoteClient::start(
            link.clone(),
            &RemoteConfig::new("localhost", 0, "secret"),
            Dispatcher::new(),
            |_| Ok(()),
        )
        .unwrap();
        (client, link)
    }

    #[test]
    fn close_releases_waiting_calls() {
        let (client, link) = client();
        assert_eq!(client.state(), PeerState::Connected);

        thread::scope(|scope| {
            let caller = scope.spawn(|| client.call("get_value", vec![json!(42)]));

            // Wait until the call has been written.
            let cipher = Cipher::new("secret");
            let mut calls = Vec::new();
            while calls.is_empty() {
                thread::sleep(Duration::from_millis(5));
                calls.extend(link.take_envelopes().into_iter().filter_map(|envelope| {
                    match envelope.body {
                        Body::Contents(text) => Some(cipher.decrypt_payload(&text).unwrap()),
                        _ => None,
                    }
                }));
            }
            assert!(matches!(&calls[0], Payload::Call(call) if call.func == "get_value"));

            client.close();
            let error = caller.join().unwrap().unwrap_err();
            assert_eq!(error.kind(), ErrorKind::ChannelClosed);
        });

        assert_eq!(client.state(), PeerState::Closed);

        // Calls on a closed client fail right away.
        let error = client.invoke("get_value", Vec::new(), Map::new()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ChannelClosed);

        // Idempotent.
        client.close();
    }
}
