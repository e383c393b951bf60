//! waylink - network-transparent input relay for Wayland
//!
//! Entry point: CLI parsing, logging, and exit-code mapping. The two
//! long-running roles live in [`waylink::server`] and [`waylink::client`];
//! the remaining verbs are one-shot requests against a running server's
//! control socket.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waylink::capture::CaptureError;
use waylink::client::{ClientOptions, ClientStatus};
use waylink::config::Config;
use waylink::control::{self, socket_path, ControlError};
use waylink::monitors::{self, MonitorsJson};
use waylink::protocol::{ControlEvent, StatusReport, SwitchAction};
use waylink::transport::TransportError;

/// Clean shutdown.
const EXIT_OK: u8 = 0;
/// Unclassified failure.
const EXIT_FAILURE: u8 = 1;
/// Missing privileges for devices.
const EXIT_PRIVILEGE: u8 = 2;
/// Configuration could not be loaded.
const EXIT_CONFIG: u8 = 3;
/// Required port or socket is in use.
const EXIT_PORT_IN_USE: u8 = 4;

/// Command-line arguments for waylink
#[derive(Parser, Debug)]
#[command(name = "waylink")]
#[command(version, about = "Share one keyboard and mouse across Wayland machines", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (pretty|compact|json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server (captures and forwards local input)
    Server {
        /// Listen address override
        #[arg(short, long)]
        listen: Option<String>,

        /// Listen port override
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a relay client (receives and injects input)
    Client {
        /// Server to connect to, HOST:PORT
        #[arg(long)]
        host: String,

        /// Display name announced to the server
        #[arg(long)]
        name: Option<String>,

        /// Private key path (default: agent, then ~/.ssh/id_ed25519)
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Route input to the client in the given slot (1-5)
    Connect {
        /// Slot number in connection order
        #[arg(value_parser = clap::value_parser!(u8).range(1..=5))]
        slot: u8,
    },

    /// Route input back to the local session
    Release,

    /// Show the running server's routing state
    Status,

    /// Rotate or toggle the active client
    Switch {
        /// Rotate forward (default)
        #[arg(long)]
        next: bool,

        /// Rotate backward
        #[arg(long, conflicts_with = "next")]
        prev: bool,

        /// Legacy: connect to the first client
        #[arg(long, conflicts_with_all = ["next", "prev"])]
        enable: bool,

        /// Legacy: release
        #[arg(long, conflicts_with_all = ["next", "prev", "enable"])]
        disable: bool,
    },

    /// Print this machine's monitor layout
    Monitors {
        /// Emit JSON instead of human-readable text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Configuration first: the log level may come from it.
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_logging(&cli, &config);

    match run(cli, config).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(classify_error(&e))
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    }
}

fn init_logging(cli: &Cli, config: &Config) {
    // Precedence: LOG_LEVEL env, then -v flags, then the config file.
    let env_filter = match std::env::var("LOG_LEVEL") {
        Ok(level) if !level.is_empty() => tracing_subscriber::EnvFilter::new(level),
        _ => {
            let level = match cli.verbose {
                0 => config.logging.level.as_str(),
                1 => "debug",
                _ => "trace",
            };
            tracing_subscriber::EnvFilter::new(format!("waylink={level},warn"))
        }
    };

    let format = if cli.log_format == "pretty" {
        config.logging.format.as_str()
    } else {
        cli.log_format.as_str()
    };
    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        "compact" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Command::Server { listen, port } => {
            let config = config.with_overrides(listen, port);
            config.validate()?;
            info!("starting waylink server v{}", env!("CARGO_PKG_VERSION"));
            waylink::server::run(config).await
        }

        Command::Client { host, name, key } => {
            let options = ClientOptions {
                server_addr: host,
                key_path: key.or(config.client.user_key_path.clone()),
                name: name.or(config.client.name.clone()),
                max_frame: config.server.max_frame_size,
            };
            info!("starting waylink client v{}", env!("CARGO_PKG_VERSION"));

            let shutdown = tokio_util::sync::CancellationToken::new();
            {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("shutdown signal received");
                    shutdown.cancel();
                });
            }

            waylink::client::run(options, shutdown, |status| match status {
                ClientStatus::AwaitingApproval => {
                    eprintln!("waiting for the server operator to approve this machine's key")
                }
                ClientStatus::Controlling => info!("this machine now receives input"),
                ClientStatus::Idle => info!("idle"),
                _ => {}
            })
            .await
        }

        Command::Connect { slot } => send_request(ControlEvent::Connect { slot }).await,

        Command::Release => send_request(ControlEvent::Release).await,

        Command::Status => {
            let response = control::request(&socket_path(), ControlEvent::Status)
                .await
                .context("cannot query the server")?;
            match response {
                ControlEvent::StatusResponse(report) => {
                    print_status(&report);
                    Ok(())
                }
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }

        Command::Switch {
            prev,
            enable,
            disable,
            ..
        } => {
            let action = if prev {
                SwitchAction::Prev
            } else if enable {
                SwitchAction::Enable
            } else if disable {
                SwitchAction::Disable
            } else {
                SwitchAction::Next
            };
            send_request(ControlEvent::SwitchAction(action)).await
        }

        Command::Monitors { json } => print_monitors(json).await,
    }
}

/// Fire one control request and render the Ack/Err answer.
async fn send_request(request: ControlEvent) -> Result<()> {
    let response = control::request(&socket_path(), request)
        .await
        .context("cannot reach the server")?;
    match response {
        ControlEvent::Ack => {
            println!("ok");
            Ok(())
        }
        ControlEvent::Err { kind, message } => {
            anyhow::bail!("{kind}: {message}")
        }
        other => anyhow::bail!("unexpected response: {other:?}"),
    }
}

fn print_status(report: &StatusReport) {
    println!("Server:  {}:{}", report.host, report.port);
    match report.active_slot {
        0 => println!("Active:  local"),
        slot => {
            let name = report
                .clients
                .get(slot as usize - 1)
                .map(|c| c.name.as_str())
                .unwrap_or("?");
            println!("Active:  slot {slot} ({name})");
        }
    }
    if report.clients.is_empty() {
        println!("Clients: (none)");
        return;
    }
    println!("Clients:");
    for (index, client) in report.clients.iter().enumerate() {
        println!(
            "  {}. {}  {}  [{}]  up {}s",
            index + 1,
            client.name,
            client.addr,
            if client.controlled { "controlling" } else { "idle" },
            client.connected_secs,
        );
    }
}

async fn print_monitors(json: bool) -> Result<()> {
    match monitors::discover().await {
        Ok(monitors) => {
            if json {
                let doc = MonitorsJson {
                    monitors,
                    error: None,
                };
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                for monitor in &monitors {
                    println!(
                        "{}: {}x{}+{}+{}  scale {}{}",
                        monitor.name,
                        monitor.width,
                        monitor.height,
                        monitor.x,
                        monitor.y,
                        monitor.scale,
                        if monitor.primary { "  (primary)" } else { "" },
                    );
                }
            }
            Ok(())
        }
        Err(e) => {
            if json {
                let doc = MonitorsJson {
                    monitors: vec![],
                    error: Some(e.to_string()),
                };
                println!("{}", serde_json::to_string_pretty(&doc)?);
            }
            Err(e.into())
        }
    }
}

/// Map a failure to the documented exit codes.
fn classify_error(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if let Some(capture) = cause.downcast_ref::<CaptureError>() {
            if matches!(capture, CaptureError::Privilege { .. }) {
                return EXIT_PRIVILEGE;
            }
        }
        if let Some(transport) = cause.downcast_ref::<TransportError>() {
            if let TransportError::Bind { source, .. } = transport {
                if source.kind() == std::io::ErrorKind::AddrInUse {
                    return EXIT_PORT_IN_USE;
                }
            }
        }
        if let Some(control) = cause.downcast_ref::<ControlError>() {
            if matches!(control, ControlError::AlreadyRunning { .. }) {
                return EXIT_PORT_IN_USE;
            }
        }
    }
    EXIT_FAILURE
}
