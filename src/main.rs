//! # RC Link Channel Monitor
//!
//! Opens the configured receiver UART, auto-detects the link protocol, and
//! polls the dispatcher at 1 kHz while logging the normalized channel
//! vector and link state.
//!
//! On this host only the serial protocols (CRSF, SBUS, IBUS) can actually
//! be driven; the pulse protocols need GPIO edge capture and are skipped
//! during detection.

use anyhow::Result;
use std::path::Path;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use rc_link::config::Config;
use rc_link::io::{SystemClock, TokioSerialPorts};
use rc_link::radio::{FaultQuery, Radio};

/// Dispatcher poll period
const UPDATE_PERIOD_MS: u64 = 1;

/// Default configuration file path
const DEFAULT_CONFIG_PATH: &str = "rc-link.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("RC Link v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = if Path::new(&config_path).exists() {
        info!("Loading configuration from {}", config_path);
        Config::load(&config_path)?
    } else {
        info!("No configuration at {}, using defaults", config_path);
        Config::default()
    };

    let ports = TokioSerialPorts::new(&config.serial.port);
    let mut radio = Radio::new(
        config.radio.preferred,
        config.radio_options(),
        Box::new(ports),
        Box::new(SystemClock::new()),
    )?;

    if config.radio.auto_detect {
        // Detection trials busy-poll; keep them off the async executor
        let preferred = config.radio.preferred;
        let active = tokio::task::block_in_place(|| radio.select(preferred))?;
        info!("Active protocol: {}", active);
    } else {
        info!("Auto-detect disabled, staying on {}", radio.active());
    }

    let mut update_tick = interval(Duration::from_millis(UPDATE_PERIOD_MS));
    let mut log_tick = interval(Duration::from_millis(config.monitor.log_interval_ms));

    info!("Polling {} at 1 kHz, Ctrl+C to exit", radio.active());

    loop {
        tokio::select! {
            _ = update_tick.tick() => {
                radio.update();
            }

            _ = log_tick.tick() => {
                if radio.is_faulted(FaultQuery::All) {
                    warn!("{}: link down", radio.active());
                } else {
                    info!(
                        "{}: {:?} activity {:?}",
                        radio.active(),
                        radio.channels(),
                        radio.channel_activity()
                    );
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_period_matches_control_loop() {
        assert_eq!(UPDATE_PERIOD_MS, 1);
    }

    #[test]
    fn test_default_config_path() {
        assert_eq!(DEFAULT_CONFIG_PATH, "rc-link.toml");
    }
}
