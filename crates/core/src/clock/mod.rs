//! Tempo, beat and phase sources.
//!
//! The tick loop only sees [`ClockSelector`], which forwards to either the
//! free-running [`LocalClock`] or a network-synchronised source and keeps
//! the reported beat position continuous across switches.

mod network;
pub mod sync;

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    config::{ClockConfig, MAX_BPM, MIN_BPM},
    worker::Worker,
};

pub use network::NetworkClock;

/// Which implementation is currently driving the beat grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockMode {
    NetworkSynced,
    Local,
}

impl ClockMode {
    /// Short name for the status line.
    pub fn label(self) -> &'static str {
        match self {
            ClockMode::NetworkSynced => "LINK",
            ClockMode::Local => "LOCAL",
        }
    }
}

/// Snapshot of the musical clock for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockState {
    pub source: ClockMode,
    pub bpm: f64,
    /// Beats since the last transport reset. Never decreases otherwise.
    pub beat_position: f64,
    /// Fractional part of `beat_position`, in [0, 1).
    pub phase: f64,
    /// Bar length in beats.
    pub quantum: f64,
    /// Position within the bar, in [0, 1).
    pub bar_phase: f64,
    pub peer_count: usize,
    /// Transport start/stop flag. The beat keeps running while stopped.
    pub is_playing: bool,
}

impl ClockState {
    fn at_beat(source: ClockMode, bpm: f64, beat: f64, quantum: f64, peer_count: usize) -> Self {
        let quantum = if quantum > 0.0 { quantum } else { 4.0 };
        Self {
            source,
            bpm,
            beat_position: beat,
            phase: beat.rem_euclid(1.0),
            quantum,
            bar_phase: beat.rem_euclid(quantum) / quantum,
            peer_count,
            is_playing: true,
        }
    }

    fn with_playing(mut self, is_playing: bool) -> Self {
        self.is_playing = is_playing;
        self
    }
}

impl Default for ClockState {
    fn default() -> Self {
        Self::at_beat(ClockMode::Local, 120.0, 0.0, 4.0, 0)
    }
}

/// Capability shared by every tempo source.
pub trait ClockSource: Send {
    /// Reading of the source at `now`.
    fn tick(&mut self, now: Instant) -> ClockState;

    /// Changes the tempo without moving the current beat position.
    fn set_tempo(&mut self, bpm: f64, now: Instant);

    /// Starts or stops the transport. Shared with the session when the
    /// source supports start/stop sync.
    fn set_playing(&mut self, playing: bool);

    /// Moves the beat position back to zero.
    fn reset(&mut self, now: Instant);

    /// Starts or stops any background participation of the source.
    fn set_enabled(&mut self, _enabled: bool) {}

    /// Hands over the background worker, if any, so it can be joined on
    /// shutdown.
    fn take_worker(&mut self) -> Option<Worker> {
        None
    }
}

/// Linear beat timeline anchored at `origin`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeline {
    pub bpm: f64,
    pub beat_at_origin: f64,
    pub origin: Instant,
}

impl Timeline {
    /// Creates a timeline that reads `beat` at `origin`.
    pub fn new(bpm: f64, beat: f64, origin: Instant) -> Self {
        Self {
            bpm: clamp_bpm(bpm),
            beat_at_origin: beat,
            origin,
        }
    }

    /// Returns the beat position at `now`, extrapolated linearly.
    pub fn beat_at(&self, now: Instant) -> f64 {
        let seconds = if now >= self.origin {
            (now - self.origin).as_secs_f64()
        } else {
            -(self.origin - now).as_secs_f64()
        };
        self.beat_at_origin + seconds * self.bpm / 60.0
    }

    /// Re-anchors the timeline so that `beat_at(now) == beat`.
    pub fn rebase(&mut self, beat: f64, now: Instant) {
        self.beat_at_origin = beat;
        self.origin = now;
    }

    /// Changes the tempo while keeping the beat at `now` fixed.
    pub fn set_tempo(&mut self, bpm: f64, now: Instant) {
        let beat = self.beat_at(now);
        self.rebase(beat, now);
        self.bpm = clamp_bpm(bpm);
    }
}

/// Clamps `bpm` to the supported range; non-finite values become 120.
pub fn clamp_bpm(bpm: f64) -> f64 {
    if bpm.is_finite() {
        bpm.clamp(MIN_BPM, MAX_BPM)
    } else {
        120.0
    }
}

/// Free-running clock: `beat = elapsed * bpm / 60`.
#[derive(Debug, Clone)]
pub struct LocalClock {
    timeline: Timeline,
    quantum: f64,
    playing: bool,
}

impl LocalClock {
    /// Creates a playing clock at beat 0.
    pub fn new(bpm: f64, quantum: f64, now: Instant) -> Self {
        Self {
            timeline: Timeline::new(bpm, 0.0, now),
            quantum,
            playing: true,
        }
    }

    pub fn bpm(&self) -> f64 {
        self.timeline.bpm
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn rebase(&mut self, beat: f64, now: Instant) {
        self.timeline.rebase(beat, now);
    }
}

impl ClockSource for LocalClock {
    fn tick(&mut self, now: Instant) -> ClockState {
        let beat = self.timeline.beat_at(now).max(0.0);
        ClockState::at_beat(ClockMode::Local, self.timeline.bpm, beat, self.quantum, 0)
            .with_playing(self.playing)
    }

    fn set_tempo(&mut self, bpm: f64, now: Instant) {
        self.timeline.set_tempo(bpm, now);
    }

    fn set_playing(&mut self, playing: bool) {
        self.playing = playing;
    }

    fn reset(&mut self, now: Instant) {
        self.timeline.rebase(0.0, now);
    }
}

/// Switchable front for the local and network sources.
pub struct ClockSelector {
    local: LocalClock,
    network: Option<Box<dyn ClockSource>>,
    mode: ClockMode,
    /// Whole beats added to network readings so the output stays continuous.
    offset: f64,
    last_beat: f64,
    quantum: f64,
}

impl ClockSelector {
    /// Creates a selector on the local clock, switching to `network` straight away when `start_networked` is set.
    pub fn new(config: &ClockConfig, network: Option<Box<dyn ClockSource>>, now: Instant) -> Self {
        let mut selector = Self {
            local: LocalClock::new(config.default_bpm, config.quantum, now),
            network,
            mode: ClockMode::Local,
            offset: 0.0,
            last_beat: 0.0,
            quantum: config.quantum,
        };
        if config.start_networked {
            selector.toggle(now);
        }
        selector
    }

    /// A selector with no network source; toggling is a no-op.
    pub fn local_only(config: &ClockConfig, now: Instant) -> Self {
        Self::new(
            &ClockConfig {
                start_networked: false,
                ..config.clone()
            },
            None,
            now,
        )
    }

    /// Returns the source currently driving the beat.
    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn has_network(&self) -> bool {
        self.network.is_some()
    }

    /// Switches between the local and network source. The beat position is
    /// re-based onto the incoming source, moving forward by less than one
    /// beat.
    pub fn toggle(&mut self, now: Instant) -> ClockMode {
        match (self.mode, self.network.as_mut()) {
            (ClockMode::Local, Some(network)) => {
                // Only a seed: joining a session replaces it with the
                // session's play state.
                network.set_playing(self.local.is_playing());
                network.set_enabled(true);
                let reading = network.tick(now).beat_position;
                self.offset = (self.last_beat - reading).ceil();
                self.mode = ClockMode::NetworkSynced;
                info!(offset = self.offset, "clock source switched to network");
            }
            (ClockMode::Local, None) => {
                warn!("network clock unavailable, staying on local clock");
            }
            (ClockMode::NetworkSynced, network) => {
                let mut bpm = self.local.bpm();
                let mut playing = self.local.is_playing();
                if let Some(network) = network {
                    let reading = network.tick(now);
                    bpm = reading.bpm;
                    playing = reading.is_playing;
                    network.set_enabled(false);
                }
                self.local.rebase(self.last_beat, now);
                self.local.set_tempo(bpm, now);
                self.local.set_playing(playing);
                self.mode = ClockMode::Local;
                info!(beat = self.last_beat, "clock source switched to local");
            }
        }
        self.mode
    }

    /// Changes the tempo of the active source. A session tempo is only
    /// proposed while networked; the local tempo is never pushed on join.
    pub fn set_tempo(&mut self, bpm: f64, now: Instant) {
        match (self.mode, self.network.as_mut()) {
            (ClockMode::NetworkSynced, Some(network)) => network.set_tempo(bpm, now),
            _ => self.local.set_tempo(bpm, now),
        }
    }

    /// Starts or stops the transport of the active source.
    pub fn set_playing(&mut self, playing: bool) {
        match (self.mode, self.network.as_mut()) {
            (ClockMode::NetworkSynced, Some(network)) => network.set_playing(playing),
            _ => self.local.set_playing(playing),
        }
        info!(playing, "transport start/stop");
    }

    /// Explicit transport reset: the only way the beat position moves back.
    pub fn reset_transport(&mut self, now: Instant) {
        self.local.reset(now);
        if let (ClockMode::NetworkSynced, Some(network)) = (self.mode, self.network.as_mut()) {
            let reading = network.tick(now).beat_position;
            self.offset = -reading.floor();
        }
        self.last_beat = 0.0;
        info!("transport reset");
    }

    pub fn take_worker(&mut self) -> Option<Worker> {
        self.network.as_mut().and_then(|network| network.take_worker())
    }
}

impl ClockSource for ClockSelector {
    fn tick(&mut self, now: Instant) -> ClockState {
        let raw = match (self.mode, self.network.as_mut()) {
            (ClockMode::NetworkSynced, Some(network)) => {
                let mut state = network.tick(now);
                state.beat_position += self.offset;
                state
            }
            _ => self.local.tick(now),
        };

        let beat = raw.beat_position.max(self.last_beat);
        self.last_beat = beat;
        ClockState::at_beat(self.mode, raw.bpm, beat, self.quantum, raw.peer_count)
            .with_playing(raw.is_playing)
    }

    fn set_tempo(&mut self, bpm: f64, now: Instant) {
        ClockSelector::set_tempo(self, bpm, now);
    }

    fn set_playing(&mut self, playing: bool) {
        ClockSelector::set_playing(self, playing);
    }

    fn reset(&mut self, now: Instant) {
        self.reset_transport(now);
    }

    fn take_worker(&mut self) -> Option<Worker> {
        ClockSelector::take_worker(self)
    }
}

impl std::fmt::Debug for ClockSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSelector")
            .field("mode", &self.mode)
            .field("has_network", &self.network.is_some())
            .field("offset", &self.offset)
            .field("last_beat", &self.last_beat)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;

    /// Scripted source standing in for the network clock.
    struct FixedClock {
        timeline: Timeline,
        enabled: bool,
        playing: bool,
    }

    impl FixedClock {
        fn at(beat: f64, now: Instant) -> Self {
            Self {
                timeline: Timeline::new(120.0, beat, now),
                enabled: false,
                playing: true,
            }
        }
    }

    impl ClockSource for FixedClock {
        fn tick(&mut self, now: Instant) -> ClockState {
            ClockState::at_beat(
                ClockMode::NetworkSynced,
                self.timeline.bpm,
                self.timeline.beat_at(now),
                4.0,
                2,
            )
            .with_playing(self.playing)
        }

        fn set_tempo(&mut self, bpm: f64, now: Instant) {
            self.timeline.set_tempo(bpm, now);
        }

        fn reset(&mut self, now: Instant) {
            self.timeline.rebase(0.0, now);
        }

        fn set_playing(&mut self, playing: bool) {
            self.playing = playing;
        }

        fn set_enabled(&mut self, enabled: bool) {
            self.enabled = enabled;
        }
    }

    fn secs(value: f64) -> Duration {
        Duration::from_secs_f64(value)
    }

    #[test]
    fn local_clock_advances_linearly() {
        let start = Instant::now();
        let mut clock = LocalClock::new(120.0, 4.0, start);

        let state = clock.tick(start + secs(1.25));
        assert!((state.beat_position - 2.5).abs() < 1e-9);
        assert!((state.phase - 0.5).abs() < 1e-9);
        assert!((state.bar_phase - 0.625).abs() < 1e-9);
        assert_eq!(state.peer_count, 0);
        assert_eq!(state.source, ClockMode::Local);
    }

    #[test]
    fn tempo_change_keeps_beat_continuous() {
        let start = Instant::now();
        let mut clock = LocalClock::new(120.0, 4.0, start);
        clock.set_tempo(60.0, start + secs(2.0));

        let state = clock.tick(start + secs(3.0));
        assert!((state.beat_position - 5.0).abs() < 1e-9);
        assert_eq!(state.bpm, 60.0);
    }

    #[test]
    fn switching_sources_moves_less_than_one_beat() {
        let start = Instant::now();
        let network = FixedClock::at(37.3, start);
        let mut selector =
            ClockSelector::new(&ClockConfig::default(), Some(Box::new(network)), start);

        let before = selector.tick(start + secs(1.0)).beat_position;
        assert_eq!(selector.toggle(start + secs(1.0)), ClockMode::NetworkSynced);
        let after = selector.tick(start + secs(1.0));

        assert!(after.beat_position >= before);
        assert!(after.beat_position - before < 1.0);
        assert_eq!(after.source, ClockMode::NetworkSynced);
        assert_eq!(after.peer_count, 2);
        // Phase follows the incoming source.
        let incoming: f64 = 37.3 + 2.0;
        assert!((after.phase - incoming.rem_euclid(1.0)).abs() < 1e-9);

        let back_before = selector.tick(start + secs(2.0)).beat_position;
        assert_eq!(selector.toggle(start + secs(2.0)), ClockMode::Local);
        let back_after = selector.tick(start + secs(2.0)).beat_position;
        assert!((back_after - back_before).abs() < 1e-9);
    }

    /// Shares the scripted source with the test after it is boxed.
    struct SharedClock(Arc<Mutex<FixedClock>>);

    impl ClockSource for SharedClock {
        fn tick(&mut self, now: Instant) -> ClockState {
            self.0.lock().unwrap().tick(now)
        }

        fn set_tempo(&mut self, bpm: f64, now: Instant) {
            self.0.lock().unwrap().set_tempo(bpm, now);
        }

        fn set_playing(&mut self, playing: bool) {
            self.0.lock().unwrap().set_playing(playing);
        }

        fn reset(&mut self, now: Instant) {
            self.0.lock().unwrap().reset(now);
        }

        fn set_enabled(&mut self, enabled: bool) {
            self.0.lock().unwrap().set_enabled(enabled);
        }
    }

    fn shared_selector(start: Instant) -> (ClockSelector, Arc<Mutex<FixedClock>>) {
        let network = Arc::new(Mutex::new(FixedClock::at(0.0, start)));
        let selector = ClockSelector::new(
            &ClockConfig::default(),
            Some(Box::new(SharedClock(network.clone()))),
            start,
        );
        (selector, network)
    }

    #[test]
    fn local_tempo_changes_are_not_proposed_to_the_session() {
        let start = Instant::now();
        let (mut selector, network) = shared_selector(start);

        selector.set_tempo(90.0, start);
        assert_eq!(selector.tick(start).bpm, 90.0);
        assert_eq!(network.lock().unwrap().timeline.bpm, 120.0);

        selector.toggle(start);
        assert!(network.lock().unwrap().enabled);
        // The session tempo wins on joining.
        assert_eq!(selector.tick(start).bpm, 120.0);

        selector.set_tempo(100.0, start);
        assert_eq!(network.lock().unwrap().timeline.bpm, 100.0);
        assert_eq!(selector.tick(start).bpm, 100.0);
    }

    #[test]
    fn start_stop_follows_the_active_source() {
        let start = Instant::now();
        let (mut selector, network) = shared_selector(start);
        assert!(selector.tick(start).is_playing);

        selector.set_playing(false);
        let stopped = selector.tick(start + secs(1.0));
        assert!(!stopped.is_playing);
        // The beat keeps running while stopped.
        assert!((stopped.beat_position - 2.0).abs() < 1e-9);

        selector.toggle(start + secs(1.0));
        assert!(!network.lock().unwrap().playing);

        // Started elsewhere in the session.
        network.lock().unwrap().playing = true;
        assert!(selector.tick(start + secs(1.5)).is_playing);
        selector.toggle(start + secs(2.0));
        assert!(selector.tick(start + secs(2.0)).is_playing);
    }

    #[test]
    fn toggle_without_network_stays_local() {
        let start = Instant::now();
        let mut selector = ClockSelector::local_only(&ClockConfig::default(), start);
        assert_eq!(selector.toggle(start), ClockMode::Local);
        assert!(!selector.has_network());
    }

    #[test]
    fn beat_position_is_monotonic_until_reset() {
        let start = Instant::now();
        let mut selector = ClockSelector::local_only(&ClockConfig::default(), start);
        let later = selector.tick(start + secs(2.0)).beat_position;
        // A reading from the past must not move the beat backwards.
        let earlier = selector.tick(start + secs(1.0)).beat_position;
        assert!(earlier >= later);

        selector.reset_transport(start + secs(3.0));
        let reset = selector.tick(start + secs(3.0)).beat_position;
        assert!(reset < 1e-9);
    }

    #[test]
    fn tempo_is_clamped() {
        let start = Instant::now();
        let mut clock = LocalClock::new(5_000.0, 4.0, start);
        assert_eq!(clock.tick(start).bpm, MAX_BPM);
        clock.set_tempo(f64::NAN, start);
        assert_eq!(clock.tick(start).bpm, 120.0);
    }
}
