//! A toy device manager exposed to remote controllers.
//!
//! The device manager holds a handful of nodes, each with an integer value.
//! A simulated sensor changes the value of a node from time to time, and
//! every change is pushed to the connected controller.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::Parser;

use serde_json::{Value, json};

use tracing::{Level, debug, info, warn};

use tether_remote::config::{RemoteConfig, Timings, TlsFiles};
use tether_remote::error::Result;
use tether_remote::server::RemoteServer;
use tether_remote::surface::{CallSurface, argument};
use tether_remote::tether::envelope::CallError;

type Nodes = Arc<Mutex<BTreeMap<u64, i64>>>;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 5000)]
    port: u16,

    /// Password shared with the controllers.
    #[arg(long)]
    password: String,

    /// Private key for the mutually-authenticated transport.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Certificate presented by the device manager.
    #[arg(long)]
    server_certificate: Option<PathBuf>,

    /// Certificate the controllers are verified against.
    #[arg(long)]
    client_certificate: Option<PathBuf>,

    /// Interval in seconds between two simulated sensor readings.
    #[arg(long, default_value_t = 5)]
    sensor_interval: u64,

    /// Prints debug logs.
    #[arg(short, long)]
    debug: bool,
}

fn changed(node: u64, value: i64) -> Value {
    json!({
        "signal": "value_changed",
        "object": node,
        "data": { "value": value },
    })
}

fn surface(nodes: &Nodes, changes: &flume::Sender<(u64, i64)>) -> CallSurface {
    let list = Arc::clone(nodes);
    let get = Arc::clone(nodes);
    let set = Arc::clone(nodes);
    let changes = changes.clone();

    CallSurface::new()
        .register("list_nodes", move |_, _| {
            let nodes = list.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(json!(nodes.keys().collect::<Vec<_>>()))
        })
        .register("get_value", move |args, kwargs| {
            let node: u64 = argument(args, kwargs, 0, "node")?;
            get.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&node)
                .map(|value| json!(value))
                .ok_or_else(|| CallError::failed(format!("Node {node} not found")))
        })
        .register("set_value", move |args, kwargs| {
            let node: u64 = argument(args, kwargs, 0, "node")?;
            let value: i64 = argument(args, kwargs, 1, "value")?;

            let mut nodes = set.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(current) = nodes.get_mut(&node) else {
                return Err(CallError::failed(format!("Node {node} not found")));
            };
            *current = value;
            drop(nodes);

            let _ = changes.send((node, value));
            Ok(Value::Null)
        })
}

fn serve(
    config: &RemoteConfig,
    nodes: &Nodes,
    changes: &flume::Sender<(u64, i64)>,
) -> Result<RemoteServer> {
    let server = RemoteServer::bind(config, surface(nodes, changes))?;
    server.start()?;
    Ok(server)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let mut config = RemoteConfig::new(cli.host, cli.port, cli.password).timings(Timings::new());
    if let Some(files) =
        TlsFiles::from_optional(cli.key, cli.server_certificate, cli.client_certificate)?
    {
        config = config.tls(files);
    }

    let nodes: Nodes = Arc::new(Mutex::new((1..=4).map(|node| (node, 0)).collect()));
    let (changes_tx, changes_rx) = flume::unbounded();

    let mut server = serve(&config, &nodes, &changes_tx)?;
    info!("Device manager listening on {}", server.local_addr());

    let interval = Duration::from_secs(cli.sensor_interval.max(1));
    let mut reading: i64 = 0;
    loop {
        let (node, value) = match changes_rx.recv_timeout(interval) {
            Ok(change) => change,
            Err(_) => {
                // Simulated sensor reading.
                reading += 1;
                let node = reading.unsigned_abs() % 4 + 1;
                let _ = nodes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(node, reading);
                (node, reading)
            }
        };

        if !server.push(changed(node, value)) {
            debug!("Change of node {node} not sent: no controller connected");
        }

        if server.is_connected() && !server.is_alive() {
            warn!("The connection looks stuck, restarting the server");
            server.shutdown();
            server = serve(&config, &nodes, &changes_tx)?;
        }
    }
}
