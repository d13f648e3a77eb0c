// SPDX-License-Identifier: GPL-2.0
//
// freqd: event watcher.
//
// Two background threads trigger re-enforcement of the last-known-good
// profile: a udev monitor for core online/offline transitions and a
// login1 signal stream for resume-from-suspend. Both run independently of
// operator-initiated applies; the engine serializes the actual writes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, info, warn};

use freqd_core::{EngineError, PolicyEngine};

const LOGIN1_DEST: &str = "org.freedesktop.login1";
const LOGIN1_PATH: &str = "/org/freedesktop/login1";
const LOGIN1_IFACE: &str = "org.freedesktop.login1.Manager";

pub struct EventWatcher {
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl EventWatcher {
    pub fn spawn(engine: Arc<PolicyEngine>, settle: Duration) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        let hp_engine = Arc::clone(&engine);
        let hp_shutdown = Arc::clone(&shutdown);
        threads.push(
            thread::Builder::new()
                .name("cpu-hotplug".to_string())
                .spawn(move || hotplug_loop(hp_engine, hp_shutdown, settle))
                .context("failed to spawn hot-plug watcher")?,
        );

        let rs_shutdown = Arc::clone(&shutdown);
        threads.push(
            thread::Builder::new()
                .name("resume-watch".to_string())
                .spawn(move || resume_loop(engine, rs_shutdown))
                .context("failed to spawn resume watcher")?,
        );

        Ok(EventWatcher { shutdown, threads })
    }
}

impl Drop for EventWatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            // Give each thread a moment to notice the flag, then detach.
            // The resume thread may be parked on the signal stream; it
            // dies with the process.
            for _ in 0..5 {
                if handle.is_finished() {
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("watcher thread didn't shut down cleanly, detaching");
            }
        }
    }
}

/// Re-apply the last-known-good profile, logging genuine failures and
/// staying quiet about expected offline skips.
fn reenforce(engine: &PolicyEngine, reason: &str) {
    match engine.reenforce() {
        Ok(None) => debug!("{reason}: no profile to re-enforce"),
        Ok(Some(result)) => {
            let offline_skips = result.failed.values().filter(|f| f.is_offline()).count();
            if result.is_success() {
                info!(
                    "{reason}: re-enforced {} core(s), {} offline skip(s)",
                    result.applied.len(),
                    offline_skips
                );
            } else {
                for (core, failure) in result.genuine_failures() {
                    warn!("{reason}: core {core}: {failure}");
                }
                if result.rolled_back {
                    warn!("{reason}: re-enforcement rolled back");
                }
            }
        }
        Err(EngineError::Invalid(errors)) => {
            for error in &errors {
                warn!("{reason}: profile no longer valid: {error}");
            }
        }
        Err(e) => warn!("{reason}: re-enforcement failed: {e}"),
    }
}

fn hotplug_loop(engine: Arc<PolicyEngine>, shutdown: Arc<AtomicBool>, settle: Duration) {
    let socket = match udev::MonitorBuilder::new()
        .and_then(|b| b.match_subsystem("cpu"))
        .and_then(|b| b.listen())
    {
        Ok(socket) => socket,
        Err(e) => {
            warn!("cpu hot-plug monitor unavailable: {e}");
            return;
        }
    };
    info!("watching cpu subsystem for hot-plug events");

    // Hot-plug bursts (an SMT sibling pair, a whole socket) arrive as a
    // train of events; wait for a quiet period before re-enforcing once.
    let mut pending_since: Option<Instant> = None;

    while !shutdown.load(Ordering::Relaxed) {
        let mut saw_event = false;
        for event in socket.iter() {
            let name = event.sysname().to_string_lossy().to_string();
            if name.starts_with("cpu") {
                debug!("hot-plug event on {name}");
                saw_event = true;
            }
        }
        if saw_event {
            pending_since = Some(Instant::now());
        }
        if let Some(since) = pending_since {
            if since.elapsed() >= settle {
                pending_since = None;
                reenforce(&engine, "hot-plug");
            }
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn resume_loop(engine: Arc<PolicyEngine>, shutdown: Arc<AtomicBool>) {
    let mut backoff = Duration::from_millis(1000);

    while !shutdown.load(Ordering::Relaxed) {
        let connected = zbus::blocking::Connection::system().and_then(|conn| {
            let proxy = zbus::blocking::Proxy::new(
                &conn,
                LOGIN1_DEST,
                LOGIN1_PATH,
                LOGIN1_IFACE,
            )?;
            let stream = proxy.receive_signal("PrepareForSleep")?;
            Ok((conn, stream))
        });

        let (_conn, stream) = match connected {
            Ok(connected) => {
                info!("watching login1 for resume events");
                backoff = Duration::from_millis(1000);
                connected
            }
            Err(e) => {
                warn!("login1 connection error: {e}");
                let sleep_ms = backoff.as_millis() as u64;
                for _ in 0..(sleep_ms / 100) {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                backoff = (backoff * 2).min(Duration::from_secs(30));
                continue;
            }
        };

        for msg in stream {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            match msg.body().deserialize::<bool>() {
                // `false` fires on wake; `true` announces the suspend.
                Ok(false) => reenforce(&engine, "resume"),
                Ok(true) => debug!("system is suspending"),
                Err(e) => warn!("unexpected PrepareForSleep body: {e}"),
            }
        }
        warn!("login1 signal stream ended, reconnecting");
    }
}
