//! A controller for a remote device manager.
//!
//! It lists the nodes of the device manager, sets the value of each one of
//! them, and then prints the changes notified by the device manager until
//! the requested duration has elapsed.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;

use serde_json::{Map, Value, json};

use tracing::{Level, info, warn};

use tether_remote::client::RemoteClient;
use tether_remote::config::{RemoteConfig, TlsFiles};
use tether_remote::dispatcher::{Dispatcher, Owner};
use tether_remote::error::Result;
use tether_remote::router::{EventBus, NOTIFICATION_SIGNAL, NotificationRouter};
use tether_remote::signals::Callback;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of the device manager.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port of the device manager.
    #[arg(short, long, default_value_t = 5000)]
    port: u16,

    /// Password shared with the device manager.
    #[arg(long)]
    password: String,

    /// Private key for the mutually-authenticated transport.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Certificate the device manager is verified against.
    #[arg(long)]
    server_certificate: Option<PathBuf>,

    /// Certificate presented by the controller.
    #[arg(long)]
    client_certificate: Option<PathBuf>,

    /// Seconds spent receiving notifications.
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Prints debug logs.
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .init();

    let mut config = RemoteConfig::new(cli.host, cli.port, cli.password);
    if let Some(files) =
        TlsFiles::from_optional(cli.key, cli.server_certificate, cli.client_certificate)?
    {
        config = config.tls(files);
    }

    let dispatcher = Dispatcher::new();
    let bus = Arc::new(EventBus::new());

    let printer = Callback::new(|owner: &Owner, data: &Map<String, Value>| {
        info!("[{owner}] value changed: {}", serde_json::Value::Object(data.clone()));
    });
    let _ = bus.register("value_changed", &printer, None);
    let _ = bus.register(
        NOTIFICATION_SIGNAL,
        &Callback::new(|_: &Owner, data: &Map<String, Value>| {
            warn!("Unexpected notification: {}", serde_json::Value::Object(data.clone()));
        }),
        None,
    );

    let router = NotificationRouter::new(dispatcher.clone(), Arc::clone(&bus));
    let client = RemoteClient::connect(&config, dispatcher.clone(), router.handler())?;

    let nodes: Vec<u64> = client.invoke_as("list_nodes", Vec::new(), Map::new())?;
    info!("Nodes: {nodes:?}");

    for (index, node) in nodes.iter().enumerate() {
        let _ = client.call("set_value", vec![json!(node), json!(index * 100)])?;
        let value = client.call("get_value", vec![json!(node)])?;
        info!("Node {node} now holds {value}");
    }

    // Pings keep the connection alive while no notification arrives.
    let deadline = Instant::now() + Duration::from_secs(cli.duration);
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        thread::sleep(remaining.min(Duration::from_secs(5)));
        if let Err(e) = client.ping() {
            warn!("Device manager unreachable: {e}");
            break;
        }
    }

    client.close();
    dispatcher.shutdown();
    Ok(())
}
