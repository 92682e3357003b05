use std::{net::SocketAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{CliftError, Result};

/// Top-level configuration structure for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub clock: ClockConfig,
    pub overlay: OverlayConfig,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    /// Configuration used when no file is given.
    pub fn live_defaults() -> Self {
        Self::default()
    }

    /// Reads a JSON configuration file. Missing sections and fields fall back
    /// to their defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !self.audio.window_size.is_power_of_two() || self.audio.window_size < 64 {
            return Err(CliftError::InvalidInput(
                "audio.window_size must be a power of two of at least 64",
            ));
        }
        if self.audio.channels == 0 {
            return Err(CliftError::InvalidInput("audio.channels must be non-zero"));
        }
        if self.audio.sample_rate == 0 {
            return Err(CliftError::InvalidInput("audio.sample_rate must be non-zero"));
        }
        if !(MIN_BPM..=MAX_BPM).contains(&self.clock.default_bpm) {
            return Err(CliftError::InvalidInput(
                "clock.default_bpm must be between 20 and 999",
            ));
        }
        if self.clock.quantum <= 0.0 {
            return Err(CliftError::InvalidInput("clock.quantum must be positive"));
        }
        if self.scheduler.fps == 0 {
            return Err(CliftError::InvalidInput("scheduler.fps must be non-zero"));
        }
        if self.scheduler.width == 0 || self.scheduler.height == 0 {
            return Err(CliftError::InvalidInput(
                "scheduler.width and scheduler.height must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Lowest tempo the clocks accept.
pub const MIN_BPM: f64 = 20.0;
/// Highest tempo the clocks accept.
pub const MAX_BPM: f64 = 999.0;

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Number of interleaved channels in each pushed chunk.
    pub channels: usize,
    /// Analysis window length in frames. Must be a power of two.
    pub window_size: usize,
    /// A beat fires when the window volume exceeds the running average by
    /// this ratio.
    pub beat_threshold: f32,
    pub refractory_ms: u64,
    /// Windows quieter than this never trigger a beat.
    pub volume_floor: f32,
    /// Weight of the newest window in the running volume average.
    pub average_smoothing: f32,
    /// Per-window decay of the spectrum peak-hold divisor.
    pub peak_decay: f32,
    /// Lower bound for the peak-hold divisor.
    pub min_peak: f32,
    /// Pending chunks kept before the oldest is overwritten.
    pub queue_capacity: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            window_size: 1024,
            beat_threshold: 1.5,
            refractory_ms: 100,
            volume_floor: 0.02,
            average_smoothing: 0.1,
            peak_decay: 0.995,
            min_peak: 0.05,
            queue_capacity: 32,
        }
    }
}

impl AudioConfig {
    /// Minimum spacing between two beat triggers.
    pub fn refractory(&self) -> Duration {
        Duration::from_millis(self.refractory_ms)
    }
}

/// Tempo source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub default_bpm: f64,
    /// Bar length in beats.
    pub quantum: f64,
    /// Spawn the peer-sync worker at session start so the source can be
    /// toggled later.
    pub network_available: bool,
    /// Begin in network mode instead of the local clock.
    pub start_networked: bool,
    /// Share transport start/stop with peers that also enable it.
    pub start_stop_sync: bool,
    pub port: u16,
    pub bind: SocketAddr,
    /// Extra unicast or broadcast destinations for beacons. The broadcast
    /// address on `port` is always included.
    pub targets: Vec<SocketAddr>,
    pub beacon_interval_ms: u64,
    pub peer_timeout_ms: u64,
    /// Fraction of the phase error corrected per beacon.
    pub correction_gain: f64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            default_bpm: 120.0,
            quantum: 4.0,
            network_available: true,
            start_networked: false,
            start_stop_sync: false,
            port: 20808,
            bind: SocketAddr::from(([0, 0, 0, 0], 20808)),
            targets: Vec::new(),
            beacon_interval_ms: 100,
            peer_timeout_ms: 2000,
            correction_gain: 0.25,
            initial_backoff_ms: 250,
            max_backoff_ms: 5000,
        }
    }
}

impl ClockConfig {
    /// Every destination a beacon is sent to.
    pub fn beacon_targets(&self) -> Vec<SocketAddr> {
        let mut targets = vec![SocketAddr::from(([255, 255, 255, 255], self.port))];
        targets.extend(self.targets.iter().copied());
        targets
    }
}

/// WebSocket overlay listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

/// Tick loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub fps: u32,
    /// Frame size used when the terminal size cannot be queried.
    pub width: usize,
    pub height: usize,
    /// Draw the passive status row at the bottom of each frame.
    pub show_status: bool,
    pub command_capacity: usize,
    pub shutdown_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            width: 80,
            height: 24,
            show_status: true,
            command_capacity: 256,
            shutdown_timeout_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    /// Time budget of one tick at the configured frame rate.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(AppConfig::live_defaults().validate().is_ok());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"clock":{"default_bpm":128.0},"scheduler":{"fps":60}}"#)
                .unwrap();

        assert_eq!(config.clock.default_bpm, 128.0);
        assert_eq!(config.clock.quantum, 4.0);
        assert_eq!(config.scheduler.fps, 60);
        assert_eq!(config.audio.window_size, 1024);
    }

    #[test]
    fn rejects_non_power_of_two_window() {
        let mut config = AppConfig::default();
        config.audio.window_size = 1000;
        assert!(matches!(
            config.validate(),
            Err(CliftError::InvalidInput(_))
        ));
    }

    #[test]
    fn beacon_targets_include_broadcast() {
        let config = ClockConfig::default();
        let targets = config.beacon_targets();
        assert_eq!(targets[0], SocketAddr::from(([255, 255, 255, 255], 20808)));
    }
}
