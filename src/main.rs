//! ==============================================================================
//! main.rs - flexion-node demo entry point
//! ==============================================================================
//!
//! purpose:
//!     runs a leader and a follower for the configured transport inside one
//!     process, joined by the simulated medium from sim.rs. both control loops
//!     are cooperative and share one thread:
//!
//!     ┌──────────────────────────────────────────────────────────┐
//!     │                    flexion-node (this file)              │
//!     │  ┌───────────────┐   sim medium   ┌───────────────────┐  │
//!     │  │ LeaderSession │ ─────────────> │ FollowerSession   │  │
//!     │  │ (sweep angle) │                │ + AngleMonitor    │  │
//!     │  └───────────────┘                └─────────┬─────────┘  │
//!     └─────────────────────────────────────────────┼────────────┘
//!                                                   ▼
//!                                      stdout: "<degrees>\n"
//!
//! past the startup banner, stdout carries only the monitor feed; logs go to
//! stderr.
//!
//! relationships:
//!     - reads: ../config/node.toml (via config.rs)
//!     - uses: backends::simulated_pair, session.rs, monitor.rs
//!
//! ==============================================================================

use anyhow::{Context, Result};
use flexion_link::backends::simulated_pair;
use flexion_link::hal::{Clock, SystemClock};
use flexion_link::{
    AngleMonitor, FollowerLink, FollowerSession, LeaderLink, LeaderSession, LeaderTick, NodeConfig,
    ReconnectPolicy,
};
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Degrees per tick of the simulated knee sweep.
const SWEEP_STEP: f32 = 1.5;
const SWEEP_MAX: f32 = 120.0;

fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Flexion Link - Leader/Follower Demo");
    println!("===========================================================");

    // step 1: load configuration
    let config = NodeConfig::load_or_default();
    config.print_summary();

    // step 2: logging (RUST_LOG wins over the config file)
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid logging.level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // step 3: build both nodes over the simulated medium
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let (mut leader, mut follower) = simulated_pair(&config, clock.clone());
    leader.init().context("leader init failed")?;
    follower.init().context("follower init failed")?;
    info!(transport = %config.transport, "both nodes initialized");

    // step 4: sessions
    let mut leader = LeaderSession::new(
        leader,
        sweep(),
        clock.clone(),
        ReconnectPolicy::new(config.session.retry_interval()),
    )
    .with_streaming(config.session.stream_on_start);
    let mut follower = FollowerSession::new(follower);
    let mut monitor = AngleMonitor::new(config.monitor.period());

    // step 5: main loop
    let stdout = std::io::stdout();
    loop {
        match leader.tick() {
            LeaderTick::Sent(value) => debug!(value, "leader sent"),
            LeaderTick::Paused(_) | LeaderTick::Offline(_) => {}
        }

        let snapshot = follower.tick();
        if config.monitor.enabled && snapshot.connected {
            let mut out = stdout.lock();
            if monitor.observe(clock.now_ms(), snapshot.value, &mut out)? {
                out.flush()?;
            }
        }

        clock.delay(config.session.sample_interval());
    }
}

/// Triangle sweep between 0 and SWEEP_MAX degrees.
fn sweep() -> impl FnMut() -> f32 {
    let mut angle = 0.0f32;
    let mut step = SWEEP_STEP;
    move || {
        angle += step;
        if angle >= SWEEP_MAX || angle <= 0.0 {
            step = -step;
            angle = angle.clamp(0.0, SWEEP_MAX);
        }
        angle
    }
}
