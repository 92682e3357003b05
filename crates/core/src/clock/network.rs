use std::{
    io::{self, ErrorKind},
    net::UdpSocket,
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    sync::{Backoff, PeerSession, SessionParams, SyncMessage},
    ClockMode, ClockSource, ClockState, Timeline,
};
use crate::{
    config::ClockConfig,
    worker::{StopSignal, Worker},
    Result,
};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const MAX_DATAGRAM: usize = 1024;

/// What the sync worker publishes for the tick loop.
#[derive(Debug, Clone, Copy)]
struct SessionSnapshot {
    timeline: Timeline,
    peers: usize,
    playing: bool,
}

#[derive(Debug)]
enum SyncControl {
    Enable(bool),
    SetTempo(f64, Instant),
    SetPlaying(bool),
    Reset(Instant),
}

/// Clock that follows a peer session over UDP.
///
/// All socket I/O happens on a background worker. `tick` only reads the
/// latest published timeline and extrapolates it to `now`, so it never
/// blocks. With no peers, or while the socket is being re-established, the
/// timeline simply runs on at its own tempo.
pub struct NetworkClock {
    shared: Arc<ArcSwap<SessionSnapshot>>,
    control: Sender<SyncControl>,
    worker: Option<Worker>,
    quantum: f64,
}

impl NetworkClock {
    /// Starts the sync worker. The session is only joined once the clock is enabled.
    pub fn spawn(config: &ClockConfig, now: Instant) -> Result<Self> {
        let params = SessionParams {
            quantum: config.quantum,
            peer_timeout: Duration::from_millis(config.peer_timeout_ms),
            correction_gain: config.correction_gain,
        };
        let mut session = PeerSession::new(random_peer_id(), config.default_bpm, now, params);
        session.set_start_stop_sync(config.start_stop_sync);
        let shared = Arc::new(ArcSwap::from_pointee(SessionSnapshot {
            timeline: session.timeline(),
            peers: 0,
            playing: session.is_playing(),
        }));
        let (control, control_rx) = unbounded();

        let worker_shared = shared.clone();
        let worker_config = config.clone();
        let worker = Worker::spawn("clift-clock-sync", move |stop| {
            SyncWorker {
                config: worker_config,
                session,
                shared: worker_shared,
                control: control_rx,
                enabled: false,
            }
            .run(&stop)
        })?;

        Ok(Self {
            shared,
            control,
            worker: Some(worker),
            quantum: config.quantum,
        })
    }

    fn send(&self, control: SyncControl) {
        if self.control.send(control).is_err() {
            debug!("clock sync worker has exited");
        }
    }
}

impl ClockSource for NetworkClock {
    fn tick(&mut self, now: Instant) -> ClockState {
        let snapshot = **self.shared.load();
        ClockState::at_beat(
            ClockMode::NetworkSynced,
            snapshot.timeline.bpm,
            snapshot.timeline.beat_at(now).max(0.0),
            self.quantum,
            snapshot.peers,
        )
        .with_playing(snapshot.playing)
    }

    fn set_tempo(&mut self, bpm: f64, now: Instant) {
        self.send(SyncControl::SetTempo(bpm, now));
    }

    fn set_playing(&mut self, playing: bool) {
        self.send(SyncControl::SetPlaying(playing));
    }

    fn reset(&mut self, now: Instant) {
        self.send(SyncControl::Reset(now));
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.send(SyncControl::Enable(enabled));
    }

    fn take_worker(&mut self) -> Option<Worker> {
        self.worker.take()
    }
}

impl std::fmt::Debug for NetworkClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.shared.load();
        f.debug_struct("NetworkClock")
            .field("bpm", &snapshot.timeline.bpm)
            .field("peers", &snapshot.peers)
            .finish()
    }
}

struct SyncWorker {
    config: ClockConfig,
    session: PeerSession,
    shared: Arc<ArcSwap<SessionSnapshot>>,
    control: Receiver<SyncControl>,
    enabled: bool,
}

impl SyncWorker {
    fn run(mut self, stop: &StopSignal) {
        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.initial_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
        );

        while !stop.is_stopped() {
            self.apply_controls();
            self.publish();
            if !self.enabled {
                stop.sleep(POLL_INTERVAL);
                continue;
            }

            match UdpSocket::bind(self.config.bind) {
                Ok(socket) => {
                    backoff.reset();
                    info!(addr = %self.config.bind, peer_id = self.session.peer_id(), "joined clock session");
                    if let Err(error) = self.serve(&socket, stop) {
                        warn!(%error, "clock session socket failed");
                    }
                    self.session.clear_peers();
                    self.publish();
                }
                Err(error) => {
                    let delay = backoff.next_delay();
                    warn!(%error, ?delay, "cannot bind clock session socket, retrying");
                    stop.sleep(delay);
                }
            }
        }
    }

    /// Runs the protocol until the worker is stopped or disabled (`Ok`) or
    /// the socket fails (`Err`).
    fn serve(&mut self, socket: &UdpSocket, stop: &StopSignal) -> io::Result<()> {
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let targets = self.config.beacon_targets();
        let interval = Duration::from_millis(self.config.beacon_interval_ms.max(1));
        let mut next_beacon = Instant::now();
        let mut buffer = [0_u8; MAX_DATAGRAM];

        loop {
            self.apply_controls();
            if stop.is_stopped() || !self.enabled {
                self.broadcast(socket, &targets, &self.session.leave());
                info!("left clock session");
                return Ok(());
            }

            let now = Instant::now();
            if now >= next_beacon {
                self.broadcast(socket, &targets, &self.session.beacon(now));
                next_beacon = now + interval;
            }

            match socket.recv_from(&mut buffer) {
                Ok((len, from)) => match SyncMessage::decode(&buffer[..len]) {
                    Ok(message) => self.session.handle(&message, Instant::now()),
                    Err(error) => trace!(%from, %error, "ignoring malformed datagram"),
                },
                Err(error) if is_transient(&error) => {}
                Err(error) => return Err(error),
            }

            self.session.expire(Instant::now());
            self.publish();
        }
    }

    fn broadcast(&self, socket: &UdpSocket, targets: &[std::net::SocketAddr], message: &SyncMessage) {
        let Ok(bytes) = message.encode() else {
            return;
        };
        for target in targets {
            if let Err(error) = socket.send_to(&bytes, target) {
                trace!(%target, %error, "beacon not sent");
            }
        }
    }

    fn apply_controls(&mut self) {
        while let Ok(control) = self.control.try_recv() {
            match control {
                SyncControl::Enable(enabled) => {
                    if enabled && !self.enabled {
                        self.session.join();
                    }
                    self.enabled = enabled;
                }
                SyncControl::SetTempo(bpm, at) => self.session.propose_tempo(bpm, at),
                SyncControl::SetPlaying(playing) => self.session.set_playing(playing),
                SyncControl::Reset(at) => self.session.reset(at),
            }
        }
    }

    fn publish(&self) {
        self.shared.store(Arc::new(SessionSnapshot {
            timeline: self.session.timeline(),
            peers: self.session.peer_count(),
            playing: self.session.is_playing(),
        }));
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
    )
}

fn random_peer_id() -> u64 {
    Uuid::new_v4().as_u64_pair().0
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn loopback_config() -> ClockConfig {
        ClockConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            beacon_interval_ms: 10,
            ..ClockConfig::default()
        }
    }

    #[test]
    fn peer_ids_differ_between_instances() {
        let ids: std::collections::HashSet<u64> = (0..64).map(|_| random_peer_id()).collect();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn runs_like_a_local_clock_without_peers() {
        let start = Instant::now();
        let mut clock = NetworkClock::spawn(&loopback_config(), start).unwrap();

        let state = clock.tick(start + Duration::from_secs(1));
        assert_eq!(state.source, ClockMode::NetworkSynced);
        assert_eq!(state.peer_count, 0);
        assert!((state.beat_position - 2.0).abs() < 1e-6);

        let worker = clock.take_worker().unwrap();
        assert!(worker.stop_and_join(Duration::from_secs(2)));
    }

    #[test]
    fn tempo_proposals_reach_the_published_timeline() {
        let start = Instant::now();
        let mut clock = NetworkClock::spawn(&loopback_config(), start).unwrap();
        clock.set_enabled(true);
        clock.set_tempo(90.0, start);

        let deadline = Instant::now() + Duration::from_secs(2);
        while clock.tick(Instant::now()).bpm != 90.0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(clock.tick(Instant::now()).bpm, 90.0);

        let worker = clock.take_worker().unwrap();
        assert!(worker.stop_and_join(Duration::from_secs(2)));
    }

    #[test]
    fn keeps_retrying_until_the_port_is_free() {
        let blocker = UdpSocket::bind("127.0.0.1:0").unwrap();
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
        let config = ClockConfig {
            bind: blocker.local_addr().unwrap(),
            targets: vec![listener.local_addr().unwrap()],
            initial_backoff_ms: 10,
            max_backoff_ms: 40,
            ..loopback_config()
        };

        let mut clock = NetworkClock::spawn(&config, Instant::now()).unwrap();
        clock.set_enabled(true);

        // Several capped retries go by without a socket.
        let mut buffer = [0_u8; MAX_DATAGRAM];
        std::thread::sleep(Duration::from_millis(300));
        assert!(listener.recv_from(&mut buffer).is_err());

        drop(blocker);
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut beacon = None;
        while beacon.is_none() && Instant::now() < deadline {
            if let Ok((len, _)) = listener.recv_from(&mut buffer) {
                beacon = SyncMessage::decode(&buffer[..len]).ok();
            }
        }
        assert!(matches!(beacon, Some(SyncMessage::Beacon { .. })), "{beacon:?}");

        let worker = clock.take_worker().unwrap();
        assert!(worker.stop_and_join(Duration::from_secs(2)));
    }
}
