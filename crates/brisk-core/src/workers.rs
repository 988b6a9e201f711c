//! Multi-process startup and worker supervision.
//!
//! `start` is the blocking entry point.  With `workers > 1` the root process
//! re-execs the current binary once per worker (marked via `BRISK_WORKER`);
//! each worker binds its listeners with `SO_REUSEPORT` so the kernel spreads
//! accepted connections.  The root supervises: a worker that dies while the
//! system is running is re-spawned; once a stop is requested, exits are
//! final.
//!
//! Terminal-delivered SIGINT reaches the whole process group, so an operator
//! Ctrl-C drains every worker gracefully; programmatic `stop` kills workers
//! from the root as a backstop.

use std::process::Stdio;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::CoreError;
use crate::lifecycle::StateEvent;
use crate::reactor::{Reactor, ReactorSettings};

/// Environment variable marking a spawned worker (1-based index).
pub const WORKER_ENV: &str = "BRISK_WORKER";
/// Environment variable carrying the root pid to workers (cluster socket
/// naming).
pub const ROOT_PID_ENV: &str = "BRISK_ROOT_PID";

/// Startup options for [`start`].
pub struct StartOptions {
    /// Runtime worker threads per process; 0 uses the core count.
    pub threads: usize,
    /// Total processes serving connections.  1 disables supervision.
    pub workers: usize,
    pub settings: ReactorSettings,
}

impl Default for StartOptions {
    fn default() -> Self {
        StartOptions {
            threads: 0,
            workers: 1,
            settings: ReactorSettings::default(),
        }
    }
}

/// Whether this process is a spawned worker.
pub fn is_worker_process() -> bool {
    std::env::var(WORKER_ENV).is_ok()
}

/// The pid of the root process (own pid when not a worker).
pub fn root_pid() -> u32 {
    std::env::var(ROOT_PID_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(std::process::id)
}

/// Build a runtime, run `init` (bind listeners, attach engines), then drive
/// the reactor until a stop signal.  Returns after a clean drain; bind and
/// spawn failures surface as errors, which callers map to a non-zero exit.
pub fn start<F>(opts: StartOptions, init: F) -> Result<(), CoreError>
where
    F: FnOnce(&Reactor) -> Result<(), CoreError>,
{
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if opts.threads > 0 {
        builder.worker_threads(opts.threads);
    }
    let runtime = builder.enable_all().build().map_err(CoreError::Io)?;

    runtime.block_on(async move {
        let mut settings = opts.settings;
        settings.workers = opts.workers;
        let reactor = Reactor::new(settings);

        reactor.fire_state(StateEvent::PreStart);
        if is_worker_process() {
            reactor.fire_state(StateEvent::InChild);
        }

        init(&reactor)?;
        reactor.stop_on_signals();

        if !is_worker_process() && opts.workers > 1 {
            tokio::spawn(supervise(reactor.clone(), opts.workers - 1));
        }

        info!(
            worker = reactor.worker_id(),
            pid = std::process::id(),
            "reactor running"
        );
        reactor.run().await;
        reactor.fire_state(StateEvent::AtExit);
        Ok(())
    })
}

/// Keep `count` workers alive until the reactor stops.
async fn supervise(reactor: Reactor, count: usize) {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            error!(%err, "cannot resolve current executable; running single-process");
            return;
        }
    };
    let root = std::process::id().to_string();

    let spawn = |index: usize| {
        tokio::process::Command::new(&exe)
            .args(std::env::args().skip(1))
            .env(WORKER_ENV, index.to_string())
            .env(ROOT_PID_ENV, &root)
            .stdin(Stdio::null())
            .spawn()
    };

    let mut children = Vec::new();
    for index in 1..=count {
        match spawn(index) {
            Ok(child) => children.push((index, child)),
            Err(err) => error!(worker = index, %err, "worker spawn failed"),
        }
    }

    loop {
        if children.is_empty() {
            return;
        }
        // Poll exits at a coarse interval; restart latency is not critical.
        tokio::time::sleep(Duration::from_millis(250)).await;

        if reactor.is_stopping() {
            for (index, child) in &mut children {
                info!(worker = *index, "stopping worker");
                let _ = child.kill().await;
            }
            return;
        }

        for entry in &mut children {
            let (index, child) = entry;
            if let Ok(Some(status)) = child.try_wait() {
                warn!(worker = *index, %status, "worker exited; re-spawning");
                match spawn(*index) {
                    Ok(new_child) => *child = new_child,
                    Err(err) => error!(worker = *index, %err, "re-spawn failed"),
                }
            }
        }
    }
}
