//! Configuration and the per-participant CLI, mirroring
//! `bach-node`'s `NodeConfig`/`Cli` split: a serde-driven config type loaded
//! from a file, and a thin `clap` layer that can override a couple of its
//! fields per process.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The run-wide launch configuration every participant is started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub num_nodes: usize,
    pub total_epochs: u64,
    /// Upper bound on one-way network delay, in seconds; drives the epoch length.
    pub delta: u64,
    /// Wall-clock time of day (`"HH:MM"`, interpreted as UTC) epoch 1 begins at.
    pub start_time: String,
    pub ports: Vec<u16>,
    pub confusion_start: Option<u64>,
    pub confusion_duration: Option<u64>,
}

impl LaunchConfig {
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("reading {path:?}: {e}")))?;
        serde_json::from_str(&content)
            .map_err(|e| EngineError::Config(format!("parsing {path:?}: {e}")))
    }

    pub fn to_file(&self, path: &Path) -> EngineResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("serializing config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| EngineError::Config(format!("writing {path:?}: {e}")))
    }

    pub fn epoch_duration(&self) -> Duration {
        Duration::from_secs(self.delta)
    }

    /// A deterministic, network-wide leader-schedule seed: every participant
    /// loads the same launch JSON, so hashing its canonical encoding gives
    /// every node the same seed without a separate negotiation step.
    pub fn leader_seed(&self) -> String {
        serde_json::to_string(self).expect("launch config always serializes")
    }

    pub fn port_for(&self, node_id: usize) -> EngineResult<u16> {
        self.ports
            .get(node_id)
            .copied()
            .ok_or_else(|| EngineError::Config(format!("no port configured for node {node_id}")))
    }

    /// Delay from `now` until the configured `start_time` (today, UTC). If
    /// that time of day has already passed, the run starts immediately.
    pub fn delay_until_start(&self, now: SystemTime) -> EngineResult<Duration> {
        let (hour, minute) = parse_hhmm(&self.start_time)?;
        let target_secs = hour as u64 * 3600 + minute as u64 * 60;
        let elapsed = now
            .duration_since(UNIX_EPOCH)
            .map_err(|e| EngineError::Config(format!("system clock before epoch: {e}")))?
            .as_secs();
        let current_secs = elapsed % 86_400;
        Ok(if target_secs > current_secs {
            Duration::from_secs(target_secs - current_secs)
        } else {
            Duration::ZERO
        })
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.ports.len() != self.num_nodes {
            return Err(EngineError::Config(format!(
                "ports has {} entries, expected num_nodes = {}",
                self.ports.len(),
                self.num_nodes
            )));
        }
        if let (Some(start), Some(duration)) = (self.confusion_start, self.confusion_duration) {
            if duration == 0 {
                return Err(EngineError::Config(
                    "confusion_duration must be positive when confusion_start is set".into(),
                ));
            }
            let _ = start;
        }
        Ok(())
    }
}

fn parse_hhmm(s: &str) -> EngineResult<(u32, u32)> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| EngineError::Config(format!("start_time {s:?} is not HH:MM")))?;
    let hour: u32 = h
        .parse()
        .map_err(|_| EngineError::Config(format!("start_time {s:?} has a non-numeric hour")))?;
    let minute: u32 = m
        .parse()
        .map_err(|_| EngineError::Config(format!("start_time {s:?} has a non-numeric minute")))?;
    if hour >= 24 || minute >= 60 {
        return Err(EngineError::Config(format!("start_time {s:?} out of range")));
    }
    Ok((hour, minute))
}

/// Per-participant process arguments.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "streamlet-node")]
#[command(about = "A Streamlet-style BFT consensus participant", long_about = None)]
pub struct Cli {
    /// This participant's index into the launch config's `ports` array.
    pub node_id: usize,

    /// Path to the launch configuration JSON.
    pub config_path: PathBuf,

    /// Overrides `ports[node_id]` from the launch config.
    #[arg(long)]
    pub port: Option<u16>,

    /// Skip waiting for `start_time` and run the recovery protocol
    /// immediately instead, as a node rejoining a run already in progress.
    #[arg(long)]
    pub rejoin: bool,

    /// Directory `chain_<node_id>.json` is read from and written to.
    #[arg(long, default_value = ".")]
    pub data_dir: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}
