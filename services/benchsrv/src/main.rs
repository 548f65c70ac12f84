//! Bench service binary
//!
//! `benchsrv run` polls the CDS unit and the current sink until Ctrl+C or
//! SIGTERM; the remaining subcommands are one-shot device operations.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use benchsrv::config::DEFAULT_CONFIG_FILE;
use benchsrv::{compute_current_for_power, BenchConfig, BenchController, GroupMode};
use clap::{Parser, Subcommand, ValueEnum};
use common::logging::{self, LogConfig};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Level};

/// Command-line arguments for benchsrv
#[derive(Parser)]
#[command(
    name = "benchsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "AC charging test bench device service",
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(
        short,
        long,
        global = true,
        env = "BENCHSRV_CONFIG",
        default_value = DEFAULT_CONFIG_FILE
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long, global = true)]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll CDS and sink power until interrupted
    Run {
        /// Record every CDS cycle to CSV
        #[arg(long)]
        record: bool,
        /// Do not poll the current sink
        #[arg(long)]
        no_sink: bool,
        /// Seconds between status lines
        #[arg(long, default_value_t = 5)]
        status_interval_secs: u64,
    },
    /// Voltage priority mode (defaults from [limits])
    VoltageMode {
        #[arg(long)]
        voltage: Option<f64>,
        #[arg(long)]
        current: Option<f64>,
        #[arg(long, value_enum, default_value_t = Device::Source)]
        device: Device,
    },
    /// Current priority mode (defaults from [limits])
    CurrentMode {
        #[arg(long)]
        current: Option<f64>,
        #[arg(long)]
        voltage: Option<f64>,
        #[arg(long, value_enum, default_value_t = Device::Sink)]
        device: Device,
    },
    /// Switch the output (interlocked on CDS voltage)
    Output {
        #[arg(value_enum)]
        state: OutputState,
        #[arg(long, value_enum, default_value_t = Device::Source)]
        device: Device,
    },
    /// Current setpoint in A (interlocked on CDS voltage)
    Setpoint {
        amps: f64,
        #[arg(long, value_enum, default_value_t = Device::Sink)]
        device: Device,
    },
    /// Read the current sink's power once
    SinkPower,
    /// Parallel operation role
    GroupMode {
        #[arg(value_enum)]
        mode: GroupModeArg,
        #[arg(long, value_enum, default_value_t = Device::Source)]
        device: Device,
    },
    /// Sink current for a target power
    CurrentForPower { power_kw: f64, voltage: f64 },
    /// Read all CDS registers once
    CdsSnapshot,
}

#[derive(Clone, Copy, ValueEnum)]
enum Device {
    Source,
    Sink,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputState {
    On,
    Off,
}

#[derive(Clone, Copy, ValueEnum)]
enum GroupModeArg {
    Master,
    Slave,
    None,
}

impl From<GroupModeArg> for GroupMode {
    fn from(arg: GroupModeArg) -> Self {
        match arg {
            GroupModeArg::Master => GroupMode::Master,
            GroupModeArg::Slave => GroupMode::Slave,
            GroupModeArg::None => GroupMode::None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Pure computation, no configuration or devices needed
    if let Command::CurrentForPower { power_kw, voltage } = cli.command {
        let amps = compute_current_for_power(power_kw, voltage)?;
        return emit(cli.json, &amps, |a| format!("{:.2} A", a));
    }

    let config = BenchConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    init_logging(&cli, &config)?;
    debug!("Config: {:?}", config);

    let controller = Arc::new(BenchController::new(config));
    let outcome = execute(&cli, &controller).await;
    if let Err(e) = &outcome {
        if let Some(bench) = e.downcast_ref::<benchsrv::BenchError>() {
            error!("{} [{}]", bench, bench.error_code());
        }
    }
    outcome
}

fn init_logging(cli: &Cli, config: &BenchConfig) -> Result<()> {
    let level_name = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let level: Level = level_name
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid log level '{}'", level_name))?;

    let log_config = LogConfig {
        service_name: "benchsrv".to_string(),
        log_dir: config.logging.dir.clone(),
        level,
        enable_json: config.logging.json,
        // Only the long-running service writes log files
        console_only: !matches!(cli.command, Command::Run { .. }),
    };
    logging::init_with_config(log_config).map_err(|e| anyhow::anyhow!("logging: {}", e))
}

fn device_host(config: &BenchConfig, device: Device) -> benchsrv::Result<String> {
    let endpoint = match device {
        Device::Source => config.voltage_source()?,
        Device::Sink => config.current_sink()?,
    };
    Ok(endpoint.host().to_string())
}

/// Fill the cache with one CDS cycle so the interlock sees a real voltage
async fn prime_interlock(controller: &BenchController) {
    let cds = match controller.config().cds() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!("{}; interlock uses {} V", e, controller.last_voltage_cds());
            return;
        },
    };
    match controller.prime_cds(cds.host()).await {
        Ok(outcome) => debug!("CDS primed: {:?}", outcome),
        Err(e) => warn!(
            "CDS read failed ({}); interlock uses {} V",
            e,
            controller.last_voltage_cds()
        ),
    }
}

async fn execute(cli: &Cli, controller: &Arc<BenchController>) -> Result<()> {
    let config = controller.config();
    match cli.command {
        Command::Run {
            record,
            no_sink,
            status_interval_secs,
        } => run(controller, record, no_sink, status_interval_secs).await,
        Command::VoltageMode {
            voltage,
            current,
            device,
        } => {
            let host = device_host(config, device)?;
            let voltage = voltage.unwrap_or(config.limits.voltage_limit);
            let current = current.unwrap_or(config.limits.current_limit);
            controller
                .set_voltage_priority_mode(&host, voltage, current)
                .await?;
            emit(cli.json, &(voltage, current), |(v, i)| {
                format!("voltage priority: {} V, ±{} A", v, i)
            })
        },
        Command::CurrentMode {
            current,
            voltage,
            device,
        } => {
            let host = device_host(config, device)?;
            let current = current.unwrap_or(config.limits.current_limit);
            let voltage = voltage.unwrap_or(config.limits.voltage_limit);
            controller
                .set_current_priority_mode(&host, current, voltage)
                .await?;
            emit(cli.json, &(current, voltage), |(i, v)| {
                format!("current priority: {} A, {} V limit", i, v)
            })
        },
        Command::Output { state, device } => {
            let host = device_host(config, device)?;
            prime_interlock(controller).await;
            let applied = controller
                .set_output(&host, matches!(state, OutputState::On))
                .await?;
            emit(cli.json, &applied, |a| {
                let state = if a.applied_on { "ON" } else { "OFF" };
                if a.interlocked {
                    format!("output {} (interlock: CDS voltage too low)", state)
                } else {
                    format!("output {}", state)
                }
            })
        },
        Command::Setpoint { amps, device } => {
            let host = device_host(config, device)?;
            prime_interlock(controller).await;
            let applied = controller.set_current_setpoint(&host, amps).await?;
            emit(cli.json, &applied, |a| {
                if a.interlocked {
                    format!(
                        "setpoint {} A (interlock: requested {} A)",
                        a.applied, a.requested
                    )
                } else {
                    format!("setpoint {} A", a.applied)
                }
            })
        },
        Command::SinkPower => {
            let host = device_host(config, Device::Sink)?;
            let reading = controller.get_sink_power_value(&host).await?;
            emit(cli.json, &reading, |r| match r.watts {
                Some(watts) => format!("{} W", watts),
                None => r.message.clone(),
            })
        },
        Command::GroupMode { mode, device } => {
            let host = device_host(config, device)?;
            let mode = GroupMode::from(mode);
            controller.set_group_mode(&host, mode).await?;
            emit(cli.json, &mode.as_scpi(), |m| format!("group mode {}", m))
        },
        Command::CdsSnapshot => {
            let cds = config.cds()?;
            let snapshot = controller.read_cds_snapshot(cds.host()).await?;
            emit(cli.json, &snapshot, |s| format!("{:#?}", s))
        },
        Command::CurrentForPower { .. } => Ok(()),
    }
}

async fn run(
    controller: &Arc<BenchController>,
    record: bool,
    no_sink: bool,
    status_interval_secs: u64,
) -> Result<()> {
    if record {
        let status = controller.start_csv_logging();
        if !status.success {
            warn!("CSV recording not started");
        }
    }

    start_polling(controller, no_sink).await?;

    let token = common::shutdown_token();
    let mut ticker = tokio::time::interval(Duration::from_secs(status_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = controller.snapshot();
                let sink = snapshot
                    .sink_power
                    .as_ref()
                    .map(|r| r.watts.map(|w| format!("{} W", w)).unwrap_or_else(|| r.message.clone()))
                    .unwrap_or_else(|| "-".to_string());
                info!(
                    "CDS {:.1} V {:.0} W {:.2} A | sink {}",
                    snapshot.voltage, snapshot.power, snapshot.current, sink
                );
            }
        }
    }

    let cds_status = controller.cds_status().await;
    controller.shutdown().await;
    info!(
        "CDS cycles: {} ({} failed)",
        cds_status.cycles, cds_status.failures
    );
    Ok(())
}

/// Start CDS and (unless disabled) sink polling; on any failure everything
/// already started is stopped again
async fn start_polling(controller: &BenchController, no_sink: bool) -> benchsrv::Result<()> {
    let started = start_pollers(controller, no_sink).await;
    if started.is_err() {
        controller.shutdown().await;
    }
    started
}

async fn start_pollers(controller: &BenchController, no_sink: bool) -> benchsrv::Result<()> {
    let config = controller.config();
    let cds = config.cds()?;
    controller
        .start_polling_cds(cds.host(), config.polling.cds_interval_ms)
        .await?;

    if no_sink {
        info!("Sink polling disabled");
        return Ok(());
    }
    match config.current_sink() {
        Ok(sink) => {
            controller
                .start_sink_power_polling(
                    sink.host(),
                    config.polling.sink_interval_ms,
                    config.polling.sink_timeout_ms,
                )
                .await?;
        },
        Err(e) => warn!("Sink polling skipped: {}", e),
    }
    Ok(())
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text(value));
    }
    Ok(())
}
