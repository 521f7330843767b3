use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rustls::ServerConfig;

use serde_json::Value;

use tracing::{debug, error, info, trace, warn};

use tether::cipher::Cipher;
use tether::envelope::Payload;

use crate::channel::ReliableChannel;
use crate::config::{RemoteConfig, Timings};
use crate::error::{Error, ErrorKind, Result};
use crate::link::{self, server_tls_config};
use crate::lock;
use crate::surface::CallSurface;

// Interval between two polls of the listening socket.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Connection {
    generation: u64,
    peer: SocketAddr,
    channel: Arc<ReliableChannel>,
}

struct Outgoing {
    generation: u64,
    event: Value,
}

struct Shared {
    surface: CallSurface,
    cipher: Cipher,
    timings: Timings,
    tls: Option<Arc<ServerConfig>>,
    active: Mutex<Option<Connection>>,
    generation: AtomicU64,
    stop: AtomicBool,
}

impl Shared {
    fn active_channel(&self, generation: u64) -> Option<Arc<ReliableChannel>> {
        lock(&self.active)
            .as_ref()
            .filter(|connection| connection.generation == generation)
            .map(|connection| Arc::clone(&connection.channel))
    }

    fn active_generation(&self) -> Option<u64> {
        lock(&self.active)
            .as_ref()
            .map(|connection| connection.generation)
    }
}

/// The feed through which the device manager pushes notifications to the
/// connected client.
///
/// Pushing never blocks: notifications are queued and sent by a dedicated
/// thread. A notification pushed while no client is connected is dropped.
#[derive(Clone)]
pub struct NotificationFeed {
    shared: Arc<Shared>,
    outgoing: flume::Sender<Outgoing>,
}

impl std::fmt::Debug for NotificationFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationFeed")
            .field("queued", &self.outgoing.len())
            .finish_non_exhaustive()
    }
}

impl NotificationFeed {
    /// Pushes a notification to the connected client.
    ///
    /// Returns `true` when the notification has been queued, `false` when it
    /// has been dropped because no client is connected.
    pub fn push(&self, event: Value) -> bool {
        let Some(generation) = self.shared.active_generation() else {
            trace!("No client connected, dropping notification");
            return false;
        };
        self.outgoing.send(Outgoing { generation, event }).is_ok()
    }
}

/// A server exposing a [`CallSurface`] to a single remote client at a time.
///
/// Calls run one after the other on the thread reading the connection, in
/// the order they arrive. A new client can connect once the previous one
/// has gone.
///
/// Dropping the server shuts it down.
pub struct RemoteServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    feed: NotificationFeed,
    outgoing: Mutex<Option<flume::Receiver<Outgoing>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemoteServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteServer")
            .field("local_addr", &self.local_addr)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl RemoteServer {
    /// Binds a [`RemoteServer`] to the configured address.
    ///
    /// Port `0` binds an ephemeral port, see [`RemoteServer::local_addr`].
    /// No connection is accepted before [`RemoteServer::start`].
    ///
    /// # Errors
    ///
    /// The configuration is invalid, the `TLS` material could not be
    /// loaded, or the address could not be bound.
    pub fn bind(config: &RemoteConfig, surface: CallSurface) -> Result<Self> {
        config.validate()?;
        let tls = config.tls.as_ref().map(server_tls_config).transpose()?;

        let listener = TcpListener::bind((config.host.as_str(), config.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            surface,
            cipher: Cipher::new(&config.password),
            timings: config.timings,
            tls,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        });

        let (outgoing_tx, outgoing_rx) = flume::unbounded();

        info!(
            "Listening on {local_addr}{}",
            if config.uses_tls() { " with TLS" } else { "" }
        );

        Ok(Self {
            feed: NotificationFeed {
                shared: Arc::clone(&shared),
                outgoing: outgoing_tx,
            },
            shared,
            local_addr,
            listener: Mutex::new(Some(listener)),
            outgoing: Mutex::new(Some(outgoing_rx)),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Starts accepting connections and forwarding notifications.
    ///
    /// # Errors
    ///
    /// The server has already been started, or its threads could not be
    /// started.
    pub fn start(&self) -> Result<()> {
        let (Some(listener), Some(outgoing)) =
            (lock(&self.listener).take(), lock(&self.outgoing).take())
        else {
            return Err(Error::new(
                ErrorKind::Config,
                "The server has already been started",
            ));
        };

        let shared = Arc::clone(&self.shared);
        self.spawn("accept", move || run_accept_loop(&shared, &listener))?;

        let shared = Arc::clone(&self.shared);
        self.spawn("notifications", move || run_forwarder(&shared, &outgoing))?;

        Ok(())
    }

    fn spawn<F>(&self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("server-{name}"))
            .spawn(body)
            .map_err(|e| {
                Error::new(
                    ErrorKind::Io,
                    format!("Impossible to start the {name} loop: {e}"),
                )
            })?;
        lock(&self.threads).push(handle);
        Ok(())
    }

    /// Returns the address the server is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the feed to push notifications with.
    #[must_use]
    pub fn notification_feed(&self) -> NotificationFeed {
        self.feed.clone()
    }

    /// Pushes a notification to the connected client.
    ///
    /// See [`NotificationFeed::push`].
    pub fn push(&self, event: Value) -> bool {
        self.feed.push(event)
    }

    /// Whether a client is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.shared.active).is_some()
    }

    /// Whether a client is connected and the connection carried some
    /// traffic within the liveness window.
    ///
    /// A client keeps an otherwise quiet connection alive through
    /// [`crate::client::RemoteClient::ping`]. A connected server which is not
    /// alive is likely stuck and can be restarted.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        lock(&self.shared.active).as_ref().is_some_and(|connection| {
            connection.channel.idle_for() <= self.shared.timings.liveness_window
        })
    }

    /// Returns the address of the connected client.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.active)
            .as_ref()
            .map(|connection| connection.peer)
    }

    /// Shuts the server down, closing the active connection.
    ///
    /// Shutting down an already shut down server does nothing.
    pub fn shutdown(&self) {
        let threads = std::mem::take(&mut *lock(&self.threads));
        if self.shared.stop.swap(true, Ordering::AcqRel) && threads.is_empty() {
            return;
        }

        if let Some(connection) = lock(&self.shared.active).as_ref() {
            connection.channel.teardown();
        }

        for handle in threads {
            if handle.join().is_err() {
                error!("A server loop panicked");
            }
        }
        info!("Server on {} shut down", self.local_addr);
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_accept_loop(shared: &Shared, listener: &TcpListener) {
    while !shared.stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((socket, peer)) => {
                info!("Accepted connection from {peer}");
                match serve(shared, socket, peer) {
                    Ok(()) => info!("Connection with {peer} closed"),
                    Err(e) => warn!("Connection with {peer} lost: {e}"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                error!("Impossible to accept a connection: {e}");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    debug!("Accept loop stopped");
}

fn serve(shared: &Shared, socket: TcpStream, peer: SocketAddr) -> Result<()> {
    socket.set_nonblocking(false)?;
    let link = link::accept(socket, shared.tls.as_ref(), shared.timings.tick)?;
    let channel = Arc::new(ReliableChannel::new(
        link,
        shared.cipher.clone(),
        shared.timings.retry_after,
    ));

    let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
    *lock(&shared.active) = Some(Connection {
        generation,
        peer,
        channel: Arc::clone(&channel),
    });

    let outcome = channel.run_reader(&shared.stop, shared.timings.tick, |payload| {
        match payload {
            Payload::Call(call) => {
                debug!("Executing `{}` for call {}", call.func, call.id);
                let result = shared.surface.call(&call);
                if let Err(e) = channel.send(&Payload::result(call.id, result)) {
                    warn!("Impossible to send the result of call {}: {e}", call.id);
                }
            }
            Payload::Result(result) => {
                warn!("Ignoring result of call {} sent by the client", result.id);
            }
            Payload::Notification(_) => warn!("Ignoring notification sent by the client"),
        }
    });

    {
        let mut active = lock(&shared.active);
        if active
            .as_ref()
            .is_some_and(|connection| connection.generation == generation)
        {
            *active = None;
        }
    }
    channel.teardown();

    outcome
}

fn run_forwarder(shared: &Shared, outgoing: &flume::Receiver<Outgoing>) {
    while !shared.stop.load(Ordering::Acquire) {
        let Ok(Outgoing { generation, event }) = outgoing.recv_timeout(shared.timings.tick) else {
            continue;
        };

        let Some(channel) = shared.active_channel(generation) else {
            trace!("Dropping notification for a closed connection");
            continue;
        };

        if let Err(e) = channel.send(&Payload::notification(event)) {
            warn!("Impossible to send a notification: {e}");
        }
    }
    debug!("Notification forwarder stopped");
}
