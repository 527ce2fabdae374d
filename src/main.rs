//! WolfMesh - IPv6 tunnel bridge for public-key routed mesh networks
//!
//! Runs one mesh node: a TUN interface bridged onto the link transport,
//! LAN discovery, the inbound link acceptor and the optional status API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmesh::address::Address;
use wolfmesh::api::{AppState, HttpServer};
use wolfmesh::bridge::{InboundPath, TunBridge};
use wolfmesh::cache::KeyCache;
use wolfmesh::config::WolfMeshConfig;
use wolfmesh::error::Result;
use wolfmesh::mesh::{Identity, LinkMesh, MeshTransport, PublicKey};
use wolfmesh::network::{Discovery, LinkAcceptor};
use wolfmesh::supervisor::{RestartPolicy, Supervisor};
use wolfmesh::tun::{LinuxTun, TunDevice};

/// WolfMesh - IPv6 tunnel bridge for public-key routed mesh networks
#[derive(Parser)]
#[command(name = "wolfmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply without one)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tunnel interface name, or "none" to run without a tunnel
    #[arg(long)]
    ifname: Option<String>,

    /// Serve the status API on this address
    #[arg(long)]
    api: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmesh.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { ref output }) => return run_init(output),
        Some(Commands::Validate) => return run_validate(&cli),
        Some(Commands::Run) | None => {}
    }

    let config = load_config(&cli)?;
    init_logging(&config.logging.level, &config.logging.format);
    run_node(config).await
}

/// Load the configuration file, if any, and apply command line overrides
fn load_config(cli: &Cli) -> Result<WolfMeshConfig> {
    let mut config = match &cli.config {
        Some(path) => WolfMeshConfig::from_file(path)?,
        None => WolfMeshConfig::default(),
    };

    if let Some(ifname) = &cli.ifname {
        config.tun.name = ifname.clone();
    }
    if let Some(api) = &cli.api {
        config.api.enabled = true;
        config.api.bind_address = api.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let compact = format == "compact";
    tracing_subscriber::registry()
        .with(env_filter)
        .with(compact.then(|| tracing_subscriber::fmt::layer().compact()))
        .with((!compact).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

/// Run a mesh node until SIGINT/SIGTERM
async fn run_node(config: WolfMeshConfig) -> Result<()> {
    let identity = Identity::generate();
    let address = Address::for_key(&identity.public_key());
    tracing::info!("Our IP address is {}", address);
    tracing::info!("Our public key is {}", identity.public_key());

    let link_mesh = LinkMesh::new(identity, config.link_config());
    link_mesh.set_recv_filter(Arc::new(move |key: &PublicKey| address.matches_key(key)));
    let mesh: Arc<dyn MeshTransport> = Arc::new(link_mesh);

    let cache = Arc::new(KeyCache::new(config.cache_ttl(), config.cache.max_entries));
    let supervisor = Supervisor::new(RestartPolicy::from_config(&config.supervisor));

    // Tunnel and bridge loops
    let (bridge, tun_name) = if config.tun_enabled() {
        let tun = LinuxTun::create(&config.tun.name, config.tun.mtu)?;
        tun.configure(&address).await?;
        let tun_name = tun.name().to_string();

        let bridge = Arc::new(TunBridge::new(
            Arc::new(tun),
            Arc::clone(&mesh),
            Arc::clone(&cache),
            config.cache.fallback,
        ));
        spawn_bridge(&supervisor, &bridge);
        (Some(bridge), Some(tun_name))
    } else {
        tracing::info!("Running without a tunnel interface");
        (None, None)
    };

    // Cache expiry
    {
        let cache = Arc::clone(&cache);
        let interval = config.sweep_interval();
        supervisor.spawn("cache-sweeper", move || {
            let cache = Arc::clone(&cache);
            async move {
                cache.run_sweeper(interval).await;
                Ok(())
            }
        });
    }

    // Inbound links
    let acceptor = Arc::new(LinkAcceptor::bind(config.listen_address()?, Arc::clone(&mesh)).await?);
    let link_port = acceptor.local_addr().port();
    supervisor.spawn("link-acceptor", move || {
        let acceptor = Arc::clone(&acceptor);
        async move { acceptor.run().await }
    });

    // LAN discovery
    if config.discovery.enabled {
        let discovery = Arc::new(Discovery::new(config.discovery.clone(), link_port, Arc::clone(&mesh)));
        let announcer = Arc::clone(&discovery);
        supervisor.spawn("discovery-announcer", move || {
            let announcer = Arc::clone(&announcer);
            async move { announcer.run_announcer().await }
        });
        supervisor.spawn("discovery-listener", move || {
            let listener = Arc::clone(&discovery);
            async move { listener.run_listener().await }
        });
    } else {
        tracing::info!("LAN discovery disabled");
    }

    // Status API
    if config.api.enabled {
        let state = AppState::new(
            tun_name,
            link_port,
            Arc::clone(&mesh),
            Arc::clone(&cache),
            bridge,
            supervisor.handle(),
        );
        let server = Arc::new(HttpServer::new(config.api_address()?, state));
        supervisor.spawn("status-api", move || {
            let server = Arc::clone(&server);
            async move { server.start().await }
        });
    }

    tracing::info!("WolfMesh node running");

    tokio::select! {
        result = shutdown_signal() => result?,
        _ = supervisor.join() => tracing::warn!("All loops stopped"),
    }

    supervisor.shutdown();
    mesh.close().await?;
    tracing::info!("WolfMesh stopped");
    Ok(())
}

fn spawn_bridge(supervisor: &Supervisor, bridge: &Arc<TunBridge>) {
    let outbound = Arc::clone(bridge);
    supervisor.spawn("tun-reader", move || {
        let bridge = Arc::clone(&outbound);
        async move { bridge.run_outbound().await }
    });

    for (name, path) in [
        ("tun-writer", InboundPath::Delivered),
        ("tun-writer-undeliverable", InboundPath::Undeliverable),
    ] {
        let inbound = Arc::clone(bridge);
        supervisor.spawn(name, move || {
            let bridge = Arc::clone(&inbound);
            async move { bridge.run_inbound(path).await }
        });
    }
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    tracing::info!("Received shutdown signal");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: &Path) -> Result<()> {
    let config_content = r#"# WolfMesh Configuration
# Generated configuration file; every value shown is the default

[tun]
name = "wolfmesh0"       # "none" runs without a tunnel
mtu = 1500

[mesh]
listen_address = "[::]:0"
queue_depth = 1024
handshake_timeout_ms = 5000

[discovery]
enabled = true
group = "ff02::114"
port = 9602
interval_ms = 2000
interfaces = []          # e.g. ["eth0", "wlan0"]; empty = default interface
connect_timeout_ms = 3000

[cache]
ttl_secs = 60
sweep_interval_secs = 10
max_entries = 65536
fallback = "prefix_guess"  # or "drop"

[api]
enabled = false
bind_address = "127.0.0.1:9603"

[logging]
level = "info"
format = "pretty"        # or "compact"

[supervisor]
restart = true
max_restarts = 5
backoff_ms = 1000
"#;

    std::fs::write(output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: wolfmesh --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(cli: &Cli) -> Result<()> {
    match load_config(cli) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Tunnel:     {}", config.tun.name);
            println!("  Listen:     {}", config.mesh.listen_address);
            println!(
                "  Discovery:  {}",
                if config.discovery.enabled { "enabled" } else { "disabled" }
            );
            println!("  Key TTL:    {} s", config.cache.ttl_secs);
            println!("  Fallback:   {:?}", config.cache.fallback);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
