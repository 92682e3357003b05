//! Minimal peer tempo/phase protocol.
//!
//! Each peer broadcasts a beacon carrying its tempo, its current beat and the
//! stamp of the tempo proposal it follows. There is no coordinator: a peer
//! adopts any proposal with a higher `(version, peer_id)` stamp and nudges
//! its own phase toward every peer it hears, modulo the bar length. Link
//! latency is ignored, which keeps convergence best-effort.
//!
//! A peer that has just joined takes the first session state it hears,
//! whatever it proposed while offline. Peers with start/stop sync enabled
//! share the play state the same way, stamped separately from the tempo.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::Timeline;

/// Datagram payload, serialised as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    Beacon {
        peer_id: u64,
        bpm: f64,
        beat: f64,
        tempo_version: u64,
        tempo_peer: u64,
        #[serde(default)]
        start_stop_sync: bool,
        #[serde(default = "default_playing")]
        playing: bool,
        #[serde(default)]
        play_version: u64,
        #[serde(default)]
        play_peer: u64,
    },
    Leave {
        peer_id: u64,
    },
}

impl SyncMessage {
    /// Serialises the message into one datagram.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parses one datagram.
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

fn default_playing() -> bool {
    true
}

/// Identifies a tempo or start/stop proposal. Larger stamps win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    pub version: u64,
    pub peer_id: u64,
}

/// Tunables for [`PeerSession`].
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    pub quantum: f64,
    pub peer_timeout: Duration,
    pub correction_gain: f64,
}

/// Protocol state of one peer. Pure: all timing is passed in.
#[derive(Debug, Clone)]
pub struct PeerSession {
    peer_id: u64,
    timeline: Timeline,
    tempo: Stamp,
    playing: bool,
    play: Stamp,
    start_stop_sync: bool,
    /// Set on join until the first session tempo is heard.
    adopt_tempo: bool,
    /// Set on join until the first synced play state is heard.
    adopt_play: bool,
    peers: HashMap<u64, Instant>,
    params: SessionParams,
}

impl PeerSession {
    /// Creates a playing session at beat 0 with no peers and start/stop sync off.
    pub fn new(peer_id: u64, bpm: f64, now: Instant, params: SessionParams) -> Self {
        Self {
            peer_id,
            timeline: Timeline::new(bpm, 0.0, now),
            tempo: Stamp {
                version: 0,
                peer_id,
            },
            playing: true,
            play: Stamp {
                version: 0,
                peer_id,
            },
            start_stop_sync: false,
            adopt_tempo: false,
            adopt_play: false,
            peers: HashMap::new(),
            params,
        }
    }

    /// Enters the session as a newcomer. Proposals made while offline are
    /// withdrawn so the session's tempo and play state are taken over
    /// instead of imposed.
    pub fn join(&mut self) {
        let fresh = Stamp {
            version: 0,
            peer_id: self.peer_id,
        };
        self.tempo = fresh;
        self.play = fresh;
        self.adopt_tempo = true;
        self.adopt_play = true;
        self.peers.clear();
    }

    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    pub fn timeline(&self) -> Timeline {
        self.timeline
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn tempo_stamp(&self) -> Stamp {
        self.tempo
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn start_stop_sync(&self) -> bool {
        self.start_stop_sync
    }

    /// Shares the play state with other synced peers, or keeps it local.
    pub fn set_start_stop_sync(&mut self, enabled: bool) {
        self.start_stop_sync = enabled;
    }

    /// Builds the beacon describing this peer at `now`.
    pub fn beacon(&self, now: Instant) -> SyncMessage {
        SyncMessage::Beacon {
            peer_id: self.peer_id,
            bpm: self.timeline.bpm,
            beat: self.timeline.beat_at(now),
            tempo_version: self.tempo.version,
            tempo_peer: self.tempo.peer_id,
            start_stop_sync: self.start_stop_sync,
            playing: self.playing,
            play_version: self.play.version,
            play_peer: self.play.peer_id,
        }
    }

    /// Builds the goodbye message sent when leaving the session.
    pub fn leave(&self) -> SyncMessage {
        SyncMessage::Leave {
            peer_id: self.peer_id,
        }
    }

    /// Proposes a new session tempo, superseding every proposal seen so far.
    pub fn propose_tempo(&mut self, bpm: f64, now: Instant) {
        self.tempo = Stamp {
            version: self.tempo.version + 1,
            peer_id: self.peer_id,
        };
        self.adopt_tempo = false;
        self.timeline.set_tempo(bpm, now);
        debug!(bpm = self.timeline.bpm, version = self.tempo.version, "proposed tempo");
    }

    /// Starts or stops the transport, superseding earlier start/stop
    /// changes. Setting the current state again is a no-op.
    pub fn set_playing(&mut self, playing: bool) {
        if playing == self.playing {
            return;
        }
        self.playing = playing;
        self.play = Stamp {
            version: self.play.version + 1,
            peer_id: self.peer_id,
        };
        self.adopt_play = false;
        debug!(playing, version = self.play.version, "proposed start/stop");
    }

    /// Restarts the local beat count. Phase keeps following the session.
    pub fn reset(&mut self, now: Instant) {
        self.timeline.rebase(0.0, now);
    }

    /// Applies a datagram from another peer. Own beacons are ignored.
    pub fn handle(&mut self, message: &SyncMessage, now: Instant) {
        match *message {
            SyncMessage::Beacon {
                peer_id,
                bpm,
                beat,
                tempo_version,
                tempo_peer,
                start_stop_sync,
                playing,
                play_version,
                play_peer,
            } => {
                if peer_id == self.peer_id || !bpm.is_finite() || !beat.is_finite() {
                    return;
                }
                if self.peers.insert(peer_id, now).is_none() {
                    debug!(peer_id, peers = self.peers.len(), "peer joined");
                }

                let stamp = Stamp {
                    version: tempo_version,
                    peer_id: tempo_peer,
                };
                if self.adopt_tempo || stamp > self.tempo {
                    self.tempo = stamp;
                    self.adopt_tempo = false;
                    self.timeline.set_tempo(bpm, now);
                    debug!(bpm, version = tempo_version, "adopted session tempo");
                }

                let play = Stamp {
                    version: play_version,
                    peer_id: play_peer,
                };
                if self.start_stop_sync && start_stop_sync && (self.adopt_play || play > self.play) {
                    self.play = play;
                    self.adopt_play = false;
                    if self.playing != playing {
                        self.playing = playing;
                        debug!(playing, version = play_version, "adopted session start/stop");
                    }
                }

                if (self.timeline.bpm - bpm).abs() < 1e-6 {
                    let error = wrap_phase(beat - self.timeline.beat_at(now), self.params.quantum);
                    self.timeline.beat_at_origin += self.params.correction_gain * error;
                    trace!(peer_id, error, "phase correction");
                }
            }
            SyncMessage::Leave { peer_id } => {
                if self.peers.remove(&peer_id).is_some() {
                    debug!(peer_id, peers = self.peers.len(), "peer left");
                }
            }
        }
    }

    /// Forgets peers that have been silent longer than the timeout.
    pub fn expire(&mut self, now: Instant) {
        let timeout = self.params.peer_timeout;
        self.peers
            .retain(|_, seen| now.saturating_duration_since(*seen) <= timeout);
    }

    pub fn clear_peers(&mut self) {
        self.peers.clear();
    }
}

/// Maps a beat difference onto `[-quantum / 2, quantum / 2)`.
pub fn wrap_phase(error: f64, quantum: f64) -> f64 {
    let quantum = if quantum > 0.0 { quantum } else { 4.0 };
    let wrapped = error.rem_euclid(quantum);
    if wrapped >= quantum / 2.0 {
        wrapped - quantum
    } else {
        wrapped
    }
}

/// Exponential retry delay, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Creates a backoff starting at `initial` and doubling up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Returns the delay before the next attempt and doubles the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Goes back to the initial delay after a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SessionParams {
        SessionParams {
            quantum: 4.0,
            peer_timeout: Duration::from_secs(2),
            correction_gain: 0.5,
        }
    }

    fn exchange(a: &mut PeerSession, b: &mut PeerSession, now: Instant) {
        let from_a = a.beacon(now);
        let from_b = b.beacon(now);
        b.handle(&from_a, now);
        a.handle(&from_b, now);
    }

    #[test]
    fn beacons_round_trip_through_json() {
        let session = PeerSession::new(7, 128.0, Instant::now(), params());
        let beacon = session.beacon(Instant::now());
        let bytes = beacon.encode().unwrap();

        assert!(String::from_utf8_lossy(&bytes).contains("\"type\":\"beacon\""));
        assert_eq!(SyncMessage::decode(&bytes).unwrap(), beacon);
    }

    #[test]
    fn own_beacons_are_ignored() {
        let now = Instant::now();
        let mut session = PeerSession::new(7, 120.0, now, params());
        let beacon = session.beacon(now);
        session.handle(&beacon, now);
        assert_eq!(session.peer_count(), 0);
    }

    #[test]
    fn newer_tempo_proposal_wins_everywhere() {
        let now = Instant::now();
        let mut a = PeerSession::new(1, 120.0, now, params());
        let mut b = PeerSession::new(2, 120.0, now, params());

        a.propose_tempo(140.0, now);
        exchange(&mut a, &mut b, now);

        assert_eq!(b.timeline().bpm, 140.0);
        assert_eq!(b.tempo_stamp(), a.tempo_stamp());

        b.propose_tempo(100.0, now);
        exchange(&mut a, &mut b, now);
        assert_eq!(a.timeline().bpm, 100.0);
        assert_eq!(a.peer_count(), 1);
    }

    #[test]
    fn phases_converge_modulo_quantum() {
        let start = Instant::now();
        let mut a = PeerSession::new(1, 120.0, start, params());
        let mut b = PeerSession::new(2, 120.0, start, params());
        // b started 9.5 beats "earlier": 1.5 beats apart within the bar.
        b.timeline.rebase(9.5, start);

        let mut now = start;
        for _ in 0..40 {
            now += Duration::from_millis(100);
            exchange(&mut a, &mut b, now);
        }

        let error = wrap_phase(b.timeline().beat_at(now) - a.timeline().beat_at(now), 4.0);
        assert!(error.abs() < 1e-3, "residual phase error {error}");
    }

    #[test]
    fn joining_peer_takes_over_the_session_tempo() {
        let now = Instant::now();
        let mut session = PeerSession::new(1, 120.0, now, params());
        let mut newcomer = PeerSession::new(2, 120.0, now, params());

        session.propose_tempo(128.0, now);
        // Offline changes outrank the session's single proposal...
        newcomer.propose_tempo(90.0, now);
        newcomer.propose_tempo(95.0, now);
        // ...but are withdrawn on joining.
        newcomer.join();
        for _ in 0..3 {
            exchange(&mut session, &mut newcomer, now);
        }

        assert_eq!(session.timeline().bpm, 128.0);
        assert_eq!(newcomer.timeline().bpm, 128.0);
        assert_eq!(newcomer.tempo_stamp(), session.tempo_stamp());
    }

    #[test]
    fn proposals_after_joining_still_win() {
        let now = Instant::now();
        let mut session = PeerSession::new(1, 120.0, now, params());
        let mut newcomer = PeerSession::new(2, 120.0, now, params());
        session.propose_tempo(128.0, now);
        newcomer.join();
        exchange(&mut session, &mut newcomer, now);

        newcomer.propose_tempo(100.0, now);
        exchange(&mut session, &mut newcomer, now);
        assert_eq!(session.timeline().bpm, 100.0);
    }

    #[test]
    fn start_stop_is_shared_between_synced_peers() {
        let now = Instant::now();
        let mut a = PeerSession::new(1, 120.0, now, params());
        let mut b = PeerSession::new(2, 120.0, now, params());
        let mut loner = PeerSession::new(3, 120.0, now, params());
        a.set_start_stop_sync(true);
        b.set_start_stop_sync(true);

        a.set_playing(false);
        exchange(&mut a, &mut b, now);
        exchange(&mut a, &mut loner, now);
        assert!(!b.is_playing());
        assert!(loner.is_playing(), "peers without start/stop sync keep their own state");

        b.set_playing(true);
        exchange(&mut a, &mut b, now);
        assert!(a.is_playing());

        // Unsynced peers neither send nor take the play state.
        loner.set_playing(false);
        exchange(&mut a, &mut loner, now);
        assert!(a.is_playing());
    }

    #[test]
    fn joining_peer_takes_over_the_play_state() {
        let now = Instant::now();
        let mut session = PeerSession::new(1, 120.0, now, params());
        let mut newcomer = PeerSession::new(2, 120.0, now, params());
        session.set_start_stop_sync(true);
        newcomer.set_start_stop_sync(true);
        session.set_playing(false);
        session.set_playing(true);
        newcomer.set_playing(false);
        newcomer.set_playing(true);
        newcomer.set_playing(false);

        newcomer.join();
        exchange(&mut session, &mut newcomer, now);
        assert!(session.is_playing());
        assert!(newcomer.is_playing());
    }

    #[test]
    fn beacons_without_start_stop_fields_still_decode() {
        let bytes = br#"{"type":"beacon","peer_id":4,"bpm":120.0,"beat":1.5,"tempo_version":0,"tempo_peer":4}"#;
        match SyncMessage::decode(bytes).unwrap() {
            SyncMessage::Beacon {
                start_stop_sync,
                playing,
                ..
            } => {
                assert!(!start_stop_sync);
                assert!(playing);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn silent_and_departed_peers_are_dropped() {
        let start = Instant::now();
        let mut a = PeerSession::new(1, 120.0, start, params());
        let b = PeerSession::new(2, 120.0, start, params());
        let c = PeerSession::new(3, 120.0, start, params());

        a.handle(&b.beacon(start), start);
        a.handle(&c.beacon(start), start);
        assert_eq!(a.peer_count(), 2);

        a.handle(&c.leave(), start);
        assert_eq!(a.peer_count(), 1);

        a.expire(start + Duration::from_secs(3));
        assert_eq!(a.peer_count(), 0);
    }

    #[test]
    fn wrap_phase_picks_shortest_direction() {
        assert!((wrap_phase(3.5, 4.0) - -0.5).abs() < 1e-12);
        assert!((wrap_phase(-3.5, 4.0) - 0.5).abs() < 1e-12);
        assert!((wrap_phase(9.25, 4.0) - 1.25).abs() < 1e-12);
    }

    #[test]
    fn backoff_doubles_up_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(1));
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }
}
