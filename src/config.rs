//! Construction-time configuration for one simulator instance.
//!
//! Everything here is fixed before the acquisition loop starts: the CLI
//! layer builds a [`SimConfig`], `validate` checks it, and the validated
//! value is consumed by the wiring in `main`. Nothing reads configuration
//! at runtime.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppResult, CamError};
use crate::snapshot;

pub const MIN_PLATFORM: u8 = 0;
pub const MAX_PLATFORM: u8 = 4;
pub const MAX_READOUT_GROUP: u8 = 7;

/// Validated settings for one simulated camera IOC.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Camera model name (see [`crate::catalog::camera_model`]).
    pub model: String,
    /// Parameter-name prefix for this instance, normalized to end in `:`.
    pub prefix: String,
    /// DAQ platform id, selects the multicast group and port.
    pub platform: u8,
    /// Readout group this client belongs to.
    pub readout_group: u8,
    /// Interface address for the multicast join; wildcard when absent.
    pub interface: Option<Ipv4Addr>,
    /// Instance name; enables the named-instance snapshot directory layout.
    pub instance: Option<String>,
    /// Root directory for named-instance snapshot data.
    pub snapshot_root: PathBuf,
    /// Snapshot files kept after each save.
    pub retention: usize,
    /// Interval between periodic snapshots.
    pub save_interval: Duration,
}

impl SimConfig {
    /// Configuration with the standard defaults for a model/prefix pair.
    pub fn new(model: impl Into<String>, prefix: &str) -> Self {
        Self {
            model: model.into(),
            prefix: normalize_prefix(prefix),
            platform: MIN_PLATFORM,
            readout_group: 0,
            interface: None,
            instance: None,
            snapshot_root: PathBuf::from("."),
            retention: snapshot::DEFAULT_RETENTION,
            save_interval: snapshot::DEFAULT_SAVE_INTERVAL,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.model.is_empty() {
            return Err(CamError::Configuration("camera model is empty".into()));
        }
        if self.prefix.is_empty() || self.prefix == ":" {
            return Err(CamError::Configuration("parameter prefix is empty".into()));
        }
        if self.platform > MAX_PLATFORM {
            return Err(CamError::Configuration(format!(
                "platform {} outside [{MIN_PLATFORM}-{MAX_PLATFORM}]",
                self.platform
            )));
        }
        if self.readout_group > MAX_READOUT_GROUP {
            return Err(CamError::Configuration(format!(
                "readout group {} outside [0-{MAX_READOUT_GROUP}]",
                self.readout_group
            )));
        }
        if self.retention == 0 {
            return Err(CamError::Configuration(
                "snapshot retention must be at least 1".into(),
            ));
        }
        if self.save_interval.is_zero() {
            return Err(CamError::Configuration(
                "snapshot interval must be positive".into(),
            ));
        }
        if let Some(name) = &self.instance {
            if name.is_empty() {
                return Err(CamError::Configuration("instance name is empty".into()));
            }
        }
        Ok(())
    }
}

/// Append a trailing `:` to a prefix that lacks one.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.ends_with(':') {
        prefix.to_string()
    } else {
        format!("{prefix}:")
    }
}
