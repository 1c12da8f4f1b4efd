//! `digiweight` – command line front end for the digital weight bridge.
//!
//! | Subcommand | Effect |
//! |---|---|
//! | `serve` | open the device (or the simulator) and run the bridge server |
//! | `probe` | time repeated `/data` round trips |
//! | `watch` | print processed telemetry through the controller client |
//! | `send` | deliver one actuator command |
//! | `config` | show or initialise `~/.digiweight/config.toml` |

mod config;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use thiserror::Error;
use tracing::{info, warn};

use digiweight_bridge::{BridgeError, BridgeServer};
use digiweight_client::{ClientError, Controller};
use digiweight_link::{
    LinkError, PortConnector, SIM_TELEMETRY_PERIOD, SerialConnector, SerialLinkManager, SimDevice,
    StateStore,
};
use digiweight_types::{Command, ForceProfile, ProcessedTelemetry, Toggle};

use config::{Config, ConfigError};

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ─────────────────────────────────────────────────────────────────────────────
// Arguments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "digiweight", version, about = "Digital weight USB bridge and client")]
struct Cli {
    /// Config file (default: ~/.digiweight/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bridge server.
    Serve(ServeArgs),
    /// Measure `/data` round-trip latency.
    Probe(ProbeArgs),
    /// Print processed telemetry.
    Watch(WatchArgs),
    /// Send one command to the actuator.
    Send(SendArgs),
    /// Inspect or create the config file.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Use the built-in simulator instead of hardware.
    #[arg(long)]
    offline: bool,
    /// Have the simulator emit telemetry (implies --offline).
    #[arg(long)]
    simulate_telemetry: bool,
    #[arg(long, value_name = "ADDR")]
    bind: Option<SocketAddr>,
    /// Substring of the serial port description to open.
    #[arg(long, value_name = "HINT")]
    device: Option<String>,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    /// Bridge root URL.
    #[arg(long)]
    url: Option<String>,
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
    /// Stop after this many requests.
    #[arg(long)]
    count: Option<u64>,
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[arg(long)]
    url: Option<String>,
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,
    /// Stop after this many samples.
    #[arg(long)]
    count: Option<u64>,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[arg(long)]
    url: Option<String>,
    /// Poll `/ack` for the device reply afterwards.
    #[arg(long)]
    wait_ack: bool,
    #[command(subcommand)]
    command: SendCommand,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum SendCommand {
    /// SET_MODE <off|on>
    Mode { kind: Toggle },
    /// SET_PULSE <off|on> DURATION STRENGTH FREQUENCY
    Pulse {
        kind: Toggle,
        duration: i64,
        strength: i64,
        frequency: i64,
    },
    /// SET_DETENTS <off|on> STRENGTH START STEP TOTAL_STEPS
    Detents {
        kind: Toggle,
        strength: i64,
        start_position: f64,
        step_position: f64,
        total_steps: i64,
    },
    /// SET_FORCE <off|constant|linear> STRENGTH START_STRENGTH START SATURATION
    Force {
        kind: ForceProfile,
        strength: i64,
        start_strength: i64,
        start_position: f64,
        saturation_position: f64,
    },
    /// SET_ROW <off|on> DAMPING GEAR_RATIO INERTIA
    Row {
        kind: Toggle,
        damping: i64,
        gear_ratio: i64,
        inertia: i64,
    },
}

impl SendCommand {
    fn into_command(self) -> Command {
        match self {
            SendCommand::Mode { kind } => Command::SetMode { kind },
            SendCommand::Pulse {
                kind,
                duration,
                strength,
                frequency,
            } => Command::SetPulse {
                kind,
                duration,
                strength,
                frequency,
            },
            SendCommand::Detents {
                kind,
                strength,
                start_position,
                step_position,
                total_steps,
            } => Command::SetDetents {
                kind,
                strength,
                start_position,
                step_position,
                total_steps,
            },
            SendCommand::Force {
                kind,
                strength,
                start_strength,
                start_position,
                saturation_position,
            } => Command::SetForce {
                kind,
                strength,
                start_strength,
                start_position,
                saturation_position,
            },
            SendCommand::Row {
                kind,
                damping,
                gear_ratio,
                inertia,
            } => Command::SetRow {
                kind,
                damping,
                gear_ratio,
                inertia,
            },
        }
    }
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Entry point
// ─────────────────────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();
    let _guard = telemetry::init_tracing("digiweight");

    if let Err(e) = run(cli) {
        eprintln!("{} {e}", "error:".red().bold());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let path = cli.config.unwrap_or_else(config::config_path);
    let cfg = config::load_or_default(&path)?;

    match cli.command {
        Commands::Serve(args) => serve(cfg, args),
        Commands::Probe(args) => probe(&cfg, args),
        Commands::Watch(args) => watch(&cfg, args),
        Commands::Send(args) => send(&cfg, args),
        Commands::Config { action } => config_command(&cfg, &path, action),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// serve
// ─────────────────────────────────────────────────────────────────────────────

fn serve(mut cfg: Config, args: ServeArgs) -> Result<(), CliError> {
    cfg.offline |= args.offline || args.simulate_telemetry;
    cfg.simulate_telemetry |= args.simulate_telemetry;
    if let Some(bind) = args.bind {
        cfg.bind_addr = bind;
    }
    if let Some(device) = args.device {
        cfg.device_hint = device;
    }

    let link_config = cfg.link_config();
    let connector: Arc<dyn PortConnector> = if cfg.offline {
        let device = if cfg.simulate_telemetry {
            SimDevice::with_telemetry(SIM_TELEMETRY_PERIOD)
        } else {
            SimDevice::new()
        };
        info!(telemetry = cfg.simulate_telemetry, "using simulated device");
        Arc::new(device.connector(link_config.device_hint.clone()))
    } else {
        Arc::new(SerialConnector::new(cfg.baud_rate))
    };
    let link = SerialLinkManager::open(connector, link_config)?;

    let mode = if cfg.offline {
        "offline".yellow()
    } else {
        "online".green()
    };
    println!(
        "  {} bridge {} on {}",
        "▶".bold(),
        mode,
        format!("http://{}", cfg.bind_addr).bold()
    );
    println!("  Press {} to stop.", "Ctrl-C".bold());

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(
        BridgeServer::new(Arc::new(link), StateStore::new())
            .with_addr(cfg.bind_addr)
            .offline(cfg.offline)
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                    std::future::pending::<()>().await;
                }
            }),
    )?;

    println!("{}", "  ✓ Bridge stopped.".green());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// probe
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct LatencyStats {
    ok: u64,
    failed: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
}

impl LatencyStats {
    fn record(&mut self, elapsed: Duration) {
        self.ok += 1;
        self.total += elapsed;
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = self.max.max(elapsed);
    }

    fn attempts(&self) -> u64 {
        self.ok + self.failed
    }

    fn mean(&self) -> Option<Duration> {
        u32::try_from(self.ok)
            .ok()
            .filter(|n| *n > 0)
            .map(|n| self.total / n)
    }
}

fn probe(cfg: &Config, args: ProbeArgs) -> Result<(), CliError> {
    let base = args.url.unwrap_or_else(|| cfg.api_url.clone());
    let url = format!("{}/data", base.trim_end_matches('/'));
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;
    let interval = Duration::from_millis(args.interval_ms);
    let shutdown = install_ctrlc();
    let mut stats = LatencyStats::default();

    println!("  Probing {} every {} ms", url.bold(), args.interval_ms);
    while !shutdown.load(Ordering::SeqCst) && args.count.is_none_or(|n| stats.attempts() < n) {
        let issued = Local::now();
        let started = Instant::now();
        let result = client.get(&url).send().and_then(|r| r.error_for_status());
        let elapsed = started.elapsed();

        match result {
            Ok(_) => {
                stats.record(elapsed);
                println!(
                    "  issued {}  received {}  elapsed {}",
                    issued.format("%H:%M:%S%.3f"),
                    Local::now().format("%H:%M:%S%.3f"),
                    format!("{:.2} ms", elapsed.as_secs_f64() * 1000.0).bold()
                );
            }
            Err(e) => {
                stats.failed += 1;
                println!("  {} {e}", "request failed:".red());
            }
        }
        sleep_unless(interval, &shutdown);
    }

    println!();
    println!("  {} ok, {} failed", stats.ok.to_string().green(), stats.failed.to_string().red());
    if let (Some(mean), Some(min)) = (stats.mean(), stats.min) {
        println!(
            "  latency min {:.2} ms  mean {:.2} ms  max {:.2} ms",
            min.as_secs_f64() * 1000.0,
            mean.as_secs_f64() * 1000.0,
            stats.max.as_secs_f64() * 1000.0
        );
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// watch / send
// ─────────────────────────────────────────────────────────────────────────────

fn connect(cfg: &Config, url: Option<String>) -> Result<Controller, CliError> {
    let url = url.unwrap_or_else(|| cfg.api_url.clone());
    let controller = Controller::connect(url.clone(), cfg.controller_config())?;
    let status = controller.get_status_sync()?;
    println!("  Bridge at {} is {}", url.bold(), status.green());
    Ok(controller)
}

fn watch(cfg: &Config, args: WatchArgs) -> Result<(), CliError> {
    let controller = connect(cfg, args.url)?;
    let interval = Duration::from_millis(args.interval_ms);
    let shutdown = install_ctrlc();
    let mut printed: u64 = 0;

    while !shutdown.load(Ordering::SeqCst) && args.count.is_none_or(|n| printed < n) {
        controller.fetch_telemetry_async()?;
        while let Some(sample) = controller.try_recv_telemetry() {
            print_sample(&sample);
            printed += 1;
        }
        sleep_unless(interval, &shutdown);
    }

    controller.cleanup();
    Ok(())
}

fn print_sample(sample: &ProcessedTelemetry) {
    println!(
        "  up {:>7.2}°  left {:>7.2}°  force {:>7.2}  pos {:>7.2}  vel {:>6.2}  virt {:>6.1}  {}",
        sample.lean_angle_up,
        sample.lean_angle_left,
        sample.force,
        sample.position,
        sample.velocity,
        sample.virtual_velocity,
        sample.status.dimmed()
    );
}

const ACK_ATTEMPTS: usize = 10;
const ACK_RETRY: Duration = Duration::from_millis(50);

fn send(cfg: &Config, args: SendArgs) -> Result<(), CliError> {
    let controller = connect(cfg, args.url)?;
    let command = args.command.into_command();
    let name = command.name();

    controller.send_command(command)?;
    controller.flush(Duration::from_millis(cfg.status_timeout_ms))?;
    println!("  {} {} sent", "✓".green().bold(), name.bold());

    if args.wait_ack {
        let mut reply = None;
        for _ in 0..ACK_ATTEMPTS {
            reply = controller.read_ack_sync()?;
            if reply.is_some() {
                break;
            }
            thread::sleep(ACK_RETRY);
        }
        match reply {
            Some(line) => println!("  device replied {}", line.cyan()),
            None => println!("  {}", "no reply from device".yellow()),
        }
    }

    controller.cleanup();
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// config
// ─────────────────────────────────────────────────────────────────────────────

fn config_command(cfg: &Config, path: &std::path::Path, action: ConfigAction) -> Result<(), CliError> {
    match action {
        ConfigAction::Show => {
            println!("  # {}", path.display().to_string().dimmed());
            let rendered = toml::to_string_pretty(cfg).map_err(ConfigError::from)?;
            println!("{rendered}");
        }
        ConfigAction::Init { force } => {
            if path.exists() && !force {
                println!(
                    "  {} already exists; pass {} to overwrite.",
                    path.display().to_string().bold(),
                    "--force".bold()
                );
                return Ok(());
            }
            config::save_to(&Config::default(), path)?;
            println!(
                "  {} Config saved to {}",
                "✓".green().bold(),
                path.display().to_string().bold()
            );
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn install_ctrlc() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }
    shutdown
}

fn sleep_unless(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
