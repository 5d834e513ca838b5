//! Servo kernel daemon entry point.
//!
//! Assembles a bank of periodic control tasks from configuration, runs one
//! supervised control session, and tears it down on an operator signal, an
//! expired run duration, or an emergency.

mod session;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use servo_common::config::KernelConfig;
use servo_rt::interlock::EmergencyInterlock;
use servo_rt::rt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::session::{build_session, open_fault_log, run_session};
use crate::signals::SignalHandler;

/// Servo daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "servo-daemon",
    about = "Servo control kernel daemon - hard real-time periodic task runner",
    version,
    long_about = None
)]
struct Args {
    /// Path to a kernel configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run duration (e.g. "30s", "5m"). Runs until a signal when unset.
    #[arg(long, short = 'd', value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Print host CPU and real-time capability information, then exit.
    #[arg(long)]
    list_cpus: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "starting servo daemon");

    if args.list_cpus {
        print_host_info();
        return Ok(());
    }

    let config = load_config(&args)?;
    config
        .validate()
        .context("configuration failed validation")?;
    info!(tasks = config.tasks.len(), "configuration loaded");

    let caps = rt::check_rt_capabilities();
    if !caps.can_use_rt_scheduling() {
        warn!("host refuses RT scheduling, control loops will run time-shared");
    }

    init_memory(&config)?;

    let signal_handler = SignalHandler::new().context("failed to set up signal handlers")?;

    let fault_log = open_fault_log(&config)?;
    let mut interlock = EmergencyInterlock::new();
    if let Some(log) = &fault_log {
        interlock.set_fault_log(Arc::clone(log));
    }
    let interlock = Arc::new(interlock);

    let mut orchestrator = build_session(&config, interlock)?;
    if let Some(log) = fault_log {
        orchestrator.set_fault_log(log);
    }
    let result = run_session(&orchestrator, &signal_handler, args.duration);
    orchestrator.destroy();
    info!("servo daemon exiting");
    result
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("servo_daemon={level},servo_rt={level},servo_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `SERVO_CONFIG_PATH` environment variable
/// 3. `/etc/servo/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<KernelConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "loading config from command-line argument");
        return KernelConfig::from_file(config_path)
            .with_context(|| format!("failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("SERVO_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "loading config from SERVO_CONFIG_PATH");
            return KernelConfig::from_file(&config_path).with_context(|| {
                format!("failed to load config from SERVO_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "SERVO_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    let system_path = PathBuf::from("/etc/servo/config.toml");
    if system_path.exists() {
        info!(?system_path, "loading config from system path");
        return KernelConfig::from_file(&system_path)
            .with_context(|| format!("failed to load config from {system_path:?}"));
    }

    let local_path = PathBuf::from("config/default.toml");
    if local_path.exists() {
        info!(?local_path, "loading config from local path");
        return KernelConfig::from_file(&local_path)
            .with_context(|| format!("failed to load config from {local_path:?}"));
    }

    info!("no config file found, using built-in defaults");
    Ok(KernelConfig::default())
}

/// Lock and pre-fault memory per configuration.
fn init_memory(config: &KernelConfig) -> Result<()> {
    if config.memory.lock_memory {
        let locked = rt::lock_memory().context("mlockall failed")?;
        if !locked {
            warn!("memory not locked, page faults may disturb the control loops");
        }
    }
    if config.memory.prefault_stack_size > 0 {
        rt::prefault_stack(config.memory.prefault_stack_size);
    }
    Ok(())
}

/// Print CPU topology and RT capability information.
fn print_host_info() {
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    let caps = rt::check_rt_capabilities();

    println!("cpus available: {cpus}");
    println!("current cpu:    {}", rt::current_cpu());
    println!("root:           {}", caps.is_root);
    println!("rtprio limit:   {:?}", caps.rtprio_limit);
    println!("memlock limit:  {:?}", caps.memlock_limit);
    println!("preempt_rt:     {}", caps.preempt_rt);
    println!("rt scheduling:  {}", caps.can_use_rt_scheduling());
    println!("memory locking: {}", caps.can_lock_memory());
}
