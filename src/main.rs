//! Binary entrypoint for the meshlink CLI.
//!
//! Commands:
//! - `init` - write a starter `meshlink.toml`
//! - `discover [--json]` - list serial ports ranked by how likely they are a radio
//! - `info [--port <path>]` - connect and print node, channel and owner details
//! - `monitor [--port <path>]` - print text messages and device log lines until Ctrl-C
//! - `send [--port <path>] --to <dest> <text>` - send a text message
//! - `status [--port <path>]` - connect and print link statistics as JSON
//!
//! See the library crate docs for module-level details: `meshlink::`.
use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::info;

use meshlink::config::Config;

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Serial link tool for Meshtastic radios")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshlink.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// List candidate serial ports
    Discover {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Connect and print device details
    Info {
        /// Device serial port; overrides the config, discovery is used when neither is set
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Stream text messages and device log output until interrupted
    Monitor {
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Send a text message
    Send {
        #[arg(short, long)]
        port: Option<String>,
        /// Destination node: `!a1b2c3d4`, a decimal node number, or `broadcast`
        #[arg(short, long, default_value = "broadcast")]
        to: String,
        /// Channel index
        #[arg(long, default_value_t = 0)]
        channel: u32,
        text: String,
    },
    /// Connect and print link statistics
    Status {
        #[arg(short, long)]
        port: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        init_logging(&None, cli.verbose);
        if !force && tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
            bail!("{} already exists (use --force to overwrite)", cli.config);
        }
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    // A missing config file is fine: every command works from defaults.
    let config = match Config::load(&cli.config).await {
        Ok(cfg) => {
            cfg.validate()?;
            Some(cfg)
        }
        Err(_) if !std::path::Path::new(&cli.config).exists() => None,
        Err(e) => return Err(e),
    };
    init_logging(&config, cli.verbose);
    let config = config.unwrap_or_default();

    run(cli.command, &config).await
}

#[cfg(feature = "serial")]
async fn run(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Init { .. } => Ok(()),
        Commands::Discover { json } => device::discover(config, json).await,
        Commands::Info { port } => device::info(config, port).await,
        Commands::Monitor { port } => device::monitor(config, port).await,
        Commands::Send {
            port,
            to,
            channel,
            text,
        } => device::send(config, port, &to, channel, &text).await,
        Commands::Status { port } => device::status(config, port).await,
    }
}

#[cfg(not(feature = "serial"))]
async fn run(_command: Commands, _config: &Config) -> Result<()> {
    bail!("this build has no serial support; rebuild with the 'serial' feature")
}

/// Parse a destination as `!hex`, `0xhex`, decimal, or `broadcast`.
fn parse_destination(s: &str) -> Result<u32> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("broadcast") || s.eq_ignore_ascii_case("all") {
        return Ok(meshlink::protobuf::BROADCAST_ADDR);
    }
    let parsed = if let Some(hex) = s.strip_prefix('!').or_else(|| s.strip_prefix("0x")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    };
    parsed.map_err(|_| anyhow::anyhow!("invalid destination '{}'", s))
}

#[cfg(feature = "serial")]
mod device {
    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use log::{info, warn};
    use tokio_util::sync::CancellationToken;

    use meshlink::config::Config;
    use meshlink::logutil::escape_log;
    use meshlink::meshtastic::{Discovery, MeshLink, RobustClient, TextMessage};

    /// How often `monitor` checks that the radio is still plugged in.
    const DEVICE_POLL: Duration = Duration::from_secs(5);

    async fn open_client(config: &Config, port: Option<String>) -> Result<RobustClient> {
        let mut settings = config.client_settings();
        if let Some(p) = port {
            settings.serial.port = p;
        }
        if settings.serial.port.trim().is_empty() {
            info!("No port configured; searching for a Meshtastic device");
            let client =
                RobustClient::auto_discover_and_connect(config.discovery_config(), settings)
                    .await?;
            return Ok(client);
        }
        let client = RobustClient::open(&settings)
            .await
            .with_context(|| format!("failed to open {}", settings.serial.port))?;
        if let Err(e) = client.connect(&CancellationToken::new()).await {
            let _ = client.close().await;
            return Err(e.into());
        }
        Ok(client)
    }

    pub async fn discover(config: &Config, json: bool) -> Result<()> {
        let cfg = config.discovery_config();
        let result = tokio::task::spawn_blocking(move || Discovery::system(cfg).discover())
            .await??;
        if json {
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(());
        }
        if result.ports.is_empty() {
            println!("No serial ports found.");
            return Ok(());
        }
        for port in &result.ports {
            let marker = match &result.best_port {
                Some(best) if best.name == port.name => "*",
                _ => " ",
            };
            let ids = match (port.vid, port.pid) {
                (Some(v), Some(p)) => format!("{v:04x}:{p:04x}"),
                _ => "----:----".to_string(),
            };
            println!(
                "{} {:<24} {} prio={:<3} {}",
                marker,
                port.name,
                ids,
                port.priority,
                port.device_type.as_deref().unwrap_or(&port.description)
            );
        }
        if result.multiple_found {
            warn!("Several Meshtastic devices found; pass --port to pick one");
        }
        Ok(())
    }

    pub async fn info(config: &Config, port: Option<String>) -> Result<()> {
        let client = open_client(config, port).await?;
        let link = client.link().clone();
        let Some(conn) = link.stream() else {
            return Ok(());
        };

        if let Some(me) = conn.my_info() {
            println!("My node: !{:08x}", me.my_node_num);
        }
        match conn.get_owner().await {
            Ok(owner) => println!("Owner: {} ({})", owner.long_name, owner.short_name),
            Err(e) => warn!("Owner request failed: {}", e),
        }
        if let Some(meta) = conn.metadata() {
            println!("Firmware: {}", meta.firmware_version);
        }
        println!("Channels:");
        for ch in conn.channels() {
            let name = ch
                .settings
                .as_ref()
                .map(|s| s.name.as_str())
                .filter(|n| !n.is_empty())
                .unwrap_or("(default)");
            println!("  [{}] {} role={}", ch.index, name, ch.role);
        }
        let mut nodes = conn.nodes();
        nodes.sort_by_key(|n| n.num);
        println!("Nodes ({}):", nodes.len());
        for n in nodes {
            let (long, short) = n
                .user
                .as_ref()
                .map(|u| (u.long_name.as_str(), u.short_name.as_str()))
                .unwrap_or(("?", "?"));
            println!("  !{:08x} {:<6} {} snr={:.1}", n.num, short, long, n.snr);
        }
        client.close().await?;
        Ok(())
    }

    pub async fn monitor(config: &Config, port: Option<String>) -> Result<()> {
        let client = open_client(config, port).await?;
        let link: Arc<dyn MeshLink> = client.link().clone();
        if let Some(conn) = link.stream() {
            conn.set_on_text(Arc::new(|msg: &TextMessage| {
                println!(
                    "[ch{}] !{:08x} -> !{:08x}: {}",
                    msg.channel,
                    msg.from,
                    msg.to,
                    escape_log(&msg.text)
                );
            }));
            conn.set_on_log_line(Arc::new(|line: &str| {
                info!(target: "device", "{}", escape_log(line));
            }));
            client.watch_device(
                Arc::new(Discovery::system(config.discovery_config())),
                conn.device_path().to_string(),
                DEVICE_POLL,
            );
        }
        info!("Monitoring; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        let stats = client.statistics();
        info!(
            "Stopping: {} frames in, {} frames out",
            stats.connection.frames_received, stats.connection.frames_sent
        );
        client.close().await?;
        Ok(())
    }

    pub async fn send(
        config: &Config,
        port: Option<String>,
        to: &str,
        channel: u32,
        text: &str,
    ) -> Result<()> {
        let destination = super::parse_destination(to)?;
        let client = open_client(config, port).await?;
        let id = client.send_text(text, destination, channel).await?;
        println!("queued packet {id:#010x} for !{destination:08x}");
        // Let the writer drain before the link is torn down.
        tokio::time::sleep(Duration::from_millis(500)).await;
        client.close().await?;
        Ok(())
    }

    pub async fn status(config: &Config, port: Option<String>) -> Result<()> {
        let client = open_client(config, port).await?;
        let stats = client.statistics();
        let queue = client.link().stream().map(|c| c.queue_status());
        let payload = serde_json::json!({
            "device": client.link().stream().map(|c| c.device_path().to_string()),
            "statistics": stats,
            "queue": queue,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        client.close().await?;
        Ok(())
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match (verbosity, config) {
        (0, Some(cfg)) => cfg.logging.level_filter(),
        (0, None) => log::LevelFilter::Info,
        (1, _) => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Foreground runs also echo to the console
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
