// SPDX-License-Identifier: GPL-2.0
//
// freqd: privileged CPU frequency/governor policy daemon.
//
// Loads the operator's profiles, applies the active one, then serves the
// D-Bus boundary while watching for hot-plug and resume events. Also
// doubles as a small CLI for one-shot applies and profile inspection.

mod config;
mod ipc;
mod watcher;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use freqd_core::{PolicyEngine, ProfileStore, SysfsScaling};

use crate::config::{DaemonConfig, DEFAULT_CONFIG_PATH};
use crate::watcher::EventWatcher;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "freqd",
    version,
    about = "Per-core CPU frequency and governor policy daemon."
)]
struct Opts {
    /// Path to the daemon configuration file.
    #[clap(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the profile directory from the configuration file.
    #[clap(long)]
    profile_dir: Option<PathBuf>,

    /// List stored profiles and exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    list_profiles: bool,

    /// Print live topology as JSON and exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    show_topology: bool,

    /// Validate a stored profile against live topology and exit.
    #[clap(long, value_name = "NAME")]
    check: Option<String>,

    /// Apply a stored profile once and exit instead of running as a daemon.
    #[clap(long, value_name = "NAME")]
    oneshot: Option<String>,

    /// Enable verbose debug output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,
}

fn init_logging(opts: &Opts) -> Result<()> {
    let level = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        level,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    init_logging(&opts)?;

    let mut cfg = DaemonConfig::load(&opts.config)?;
    if let Some(dir) = &opts.profile_dir {
        cfg.profile_dir = dir.clone();
    }
    let store = Arc::new(ProfileStore::new(&cfg.profile_dir)?);

    if opts.list_profiles {
        let names = store.list()?;
        if names.is_empty() {
            println!("No stored profiles in {}.", cfg.profile_dir.display());
        } else {
            for name in names {
                println!("{name}");
            }
        }
        return Ok(());
    }

    let iface = SysfsScaling::probe()
        .context("CPU frequency scaling is not available on this system")?;
    let engine = Arc::new(PolicyEngine::new(Arc::new(iface), cfg.write_order));

    if opts.show_topology {
        let topo = engine.snapshot()?;
        println!("{}", serde_json::to_string_pretty(&topo)?);
        return Ok(());
    }

    if let Some(name) = &opts.check {
        let profile = store.load(name)?;
        let topo = engine.snapshot()?;
        match freqd_core::validate(&profile, &topo) {
            Ok(()) => {
                println!("Profile `{name}` is valid for this topology.");
                return Ok(());
            }
            Err(errors) => {
                for error in &errors {
                    eprintln!("{error}");
                }
                bail!("profile `{name}` failed validation with {} error(s)", errors.len());
            }
        }
    }

    if !nix::unistd::Uid::effective().is_root() {
        warn!("not running as root; scaling writes will likely be rejected");
    }

    if let Some(name) = &opts.oneshot {
        let profile = store.load(name)?;
        let result = match engine.apply_profile(&profile) {
            Ok(result) => result,
            Err(freqd_core::EngineError::Invalid(errors)) => {
                for error in &errors {
                    eprintln!("{error}");
                }
                bail!("profile `{name}` failed validation with {} error(s)", errors.len());
            }
            Err(e) => return Err(e.into()),
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
        if !result.is_success() {
            bail!("apply of `{name}` did not fully succeed");
        }
        return Ok(());
    }

    // Daemon mode from here on.
    if let Some(name) = &cfg.active_profile {
        match store.load(name) {
            Ok(profile) => {
                engine.set_current(profile);
                info!("active profile is `{name}`");
                if cfg.apply_on_start {
                    match engine.reenforce() {
                        Ok(_) => {}
                        Err(e) => warn!("applying `{name}` at start failed: {e}"),
                    }
                }
            }
            Err(e) => warn!("cannot load active profile `{name}`: {e:#}"),
        }
    } else {
        info!("no active profile configured; waiting for apply requests");
    }

    let _watcher = EventWatcher::spawn(
        Arc::clone(&engine),
        Duration::from_millis(cfg.settle_ms),
    )?;

    let manager = ipc::Manager::new(
        Arc::clone(&engine),
        Arc::clone(&store),
        cfg.allowed_uids.clone(),
    )?;
    let _conn = ipc::serve(manager)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let sig_shutdown = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        sig_shutdown.store(true, Ordering::Relaxed);
    })
    .context("failed to install signal handler")?;

    info!("freqd {} up", env!("CARGO_PKG_VERSION"));
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }
    info!("shutting down");
    Ok(())
}
