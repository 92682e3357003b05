//! The fixed-rate tick loop.
//!
//! [`FrameScheduler`] owns every piece of engine state. Producer threads
//! only reach it through the audio feed and the command queue, both drained
//! at the top of each tick, so nothing inside the render path needs a lock.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, info, trace, warn};

use crate::{
    analysis::{AudioFeatureExtractor, AudioFeatures},
    audio::{AudioFeed, AudioProducer},
    clock::{ClockSelector, ClockSource},
    command::{Command, CommandQueue, CommandSender},
    compositor,
    config::{AppConfig, SchedulerConfig, MAX_BPM, MIN_BPM},
    deck::{Deck, DeckId},
    effects::{cycle_index, EffectChain, EffectKind, EffectParams},
    frame::FrameBuffer,
    overlay::{Overlays, StatusLine},
    scene::SceneRegistry,
    worker::{StopSignal, Worker},
    CliftError, Result,
};

/// Output collaborator. Receives one finished frame per tick and must not
/// keep it past the call.
pub trait FrameSink {
    fn present(&mut self, frame: &FrameBuffer) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    /// Terminal.
    ShuttingDown,
}

impl SchedulerState {
    pub fn label(self) -> &'static str {
        match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::ShuttingDown => "shutting down",
        }
    }
}

/// Crossfader and effect selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixState {
    /// 0 shows deck A, 1 shows deck B.
    pub crossfade: f32,
    pub effect_index: usize,
    pub effect_intensity: f32,
}

impl Default for MixState {
    fn default() -> Self {
        Self {
            crossfade: 0.0,
            effect_index: 0,
            effect_intensity: 1.0,
        }
    }
}

pub struct FrameScheduler {
    state: SchedulerState,
    config: SchedulerConfig,
    registry: Arc<SceneRegistry>,
    decks: [Deck; 2],
    mix: MixState,
    overlays: Overlays,
    clock: ClockSelector,
    extractor: AudioFeatureExtractor,
    audio: AudioFeed,
    commands: CommandQueue,
    effects: EffectChain,
    width: usize,
    height: usize,
    frame: FrameBuffer,
    workers: Vec<Worker>,
    started_at: Option<Instant>,
    last_tick: Option<Instant>,
    frame_index: u64,
}

impl FrameScheduler {
    /// Creates an idle scheduler. Frames are sized from `config.scheduler`.
    pub fn new(config: &AppConfig, clock: ClockSelector, registry: Arc<SceneRegistry>) -> Self {
        let scheduler = config.scheduler.clone();
        let (width, height) = (scheduler.width, scheduler.height);
        Self {
            state: SchedulerState::Idle,
            registry,
            decks: [Deck::new(DeckId::A), Deck::new(DeckId::B)],
            mix: MixState::default(),
            overlays: Overlays::new(),
            clock,
            extractor: AudioFeatureExtractor::new(config.audio.clone()),
            audio: AudioFeed::new(config.audio.queue_capacity),
            commands: CommandQueue::new(scheduler.command_capacity),
            effects: EffectChain::new(),
            width,
            height,
            frame: FrameBuffer::new(width, height),
            workers: Vec::new(),
            started_at: None,
            last_tick: None,
            frame_index: 0,
            config: scheduler,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Returns a handle for queuing commands from any thread.
    pub fn command_sender(&self) -> CommandSender {
        self.commands.sender()
    }

    /// Returns the handle audio producers push PCM chunks into.
    pub fn audio_producer(&self) -> AudioProducer {
        self.audio.producer()
    }

    /// Hands a producer thread to the scheduler so it is joined on shutdown.
    pub fn add_worker(&mut self, worker: Worker) {
        self.workers.push(worker);
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Returns the last completed frame.
    pub fn frame(&self) -> &FrameBuffer {
        &self.frame
    }

    pub fn mix(&self) -> MixState {
        self.mix
    }

    pub fn deck(&self, id: DeckId) -> &Deck {
        &self.decks[id.index()]
    }

    pub fn overlays(&self) -> &Overlays {
        &self.overlays
    }

    /// Returns the latest published audio snapshot.
    pub fn audio_features(&self) -> Arc<AudioFeatures> {
        self.extractor.current_features()
    }

    /// Moves from `Idle` to `Running`. Any other state is an error.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.state != SchedulerState::Idle {
            return Err(self.invalid_state("idle"));
        }
        if let Some(worker) = self.clock.take_worker() {
            self.workers.push(worker);
        }
        self.state = SchedulerState::Running;
        self.started_at = Some(now);
        info!(
            width = self.width,
            height = self.height,
            fps = self.config.fps,
            workers = self.workers.len(),
            "frame scheduler running"
        );
        Ok(())
    }

    /// Produces one frame: inputs, clock, commands, decks, blend, effect,
    /// overlay, in that order.
    pub fn tick(&mut self, now: Instant) -> Result<&FrameBuffer> {
        if self.state != SchedulerState::Running {
            return Err(self.invalid_state("running"));
        }

        for chunk in self.audio.drain() {
            if let Err(error) = self.extractor.ingest(&chunk) {
                warn!(%error, "dropping audio chunk");
            }
        }
        let audio = self.extractor.publish();

        let clock = self.clock.tick(now);

        for command in self.commands.drain() {
            self.apply_command(command, now);
        }

        let dt = self
            .last_tick
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default();
        self.last_tick = Some(now);

        let (width, height) = (self.width, self.height);
        for deck in &mut self.decks {
            let locked = self.registry.is_beat_locked(deck.scene());
            deck.advance(dt, &clock, locked);
        }
        let frame_a = self.decks[0].render(&self.registry, &audio, &clock, width, height)?;
        let frame_b = self.decks[1].render(&self.registry, &audio, &clock, width, height)?;

        let mixed = compositor::blend(&frame_a, &frame_b, self.mix.crossfade)?;

        let params = EffectParams {
            intensity: self.mix.effect_intensity,
            time: self
                .started_at
                .map(|start| now.saturating_duration_since(start).as_secs_f64())
                .unwrap_or_default(),
            beat: clock.beat_position,
            beat_triggered: audio.beat_triggered,
            frame: self.frame_index,
        };
        let mut frame = self.effects.apply(&mixed, self.mix.effect_index, &params);

        let status_rows = usize::from(self.config.show_status && height > 1);
        self.overlays.draw(&mut frame, status_rows);
        if status_rows > 0 {
            StatusLine {
                clock_label: clock.source.label(),
                bpm: clock.bpm,
                beat: clock.beat_position,
                bar_phase: clock.bar_phase,
                playing: clock.is_playing,
                peers: clock.peer_count,
                audio_active: audio.active,
                effect: effect_name(self.mix.effect_index),
                crossfade: self.mix.crossfade,
            }
            .draw(&mut frame);
        }

        trace!(
            frame = self.frame_index,
            beat = clock.beat_position,
            beat_triggered = audio.beat_triggered,
            "tick"
        );
        self.frame = frame;
        self.frame_index += 1;
        Ok(&self.frame)
    }

    /// Ticks at the configured rate, handing each frame to `sink`, until
    /// `stop` is raised or a fatal error occurs. Overrun ticks are skipped,
    /// never queued. Shuts down before returning.
    pub fn run<S>(&mut self, sink: &mut S, stop: &StopSignal) -> Result<()>
    where
        S: FrameSink + ?Sized,
    {
        let period = self.config.tick_period();
        let mut deadline = Instant::now();
        if self.state == SchedulerState::Idle {
            self.start(deadline)?;
        }

        let result = loop {
            if stop.is_stopped() {
                break Ok(());
            }
            if let Err(error) = self
                .tick(Instant::now())
                .and_then(|frame| sink.present(frame))
            {
                break Err(error);
            }

            let now = Instant::now();
            let (next, skipped) = next_deadline(deadline, now, period);
            if skipped > 0 {
                debug!(skipped, "tick overran, skipping frames");
            }
            deadline = next;
            stop.sleep(deadline.saturating_duration_since(now));
        };

        if let Err(error) = &result {
            warn!(%error, "frame loop stopped");
        }
        self.shutdown();
        result
    }

    /// Stops intake, signals every producer and joins them within the
    /// configured timeout. Returns `false` if some producer had to be
    /// detached. Calling it again is a no-op.
    pub fn shutdown(&mut self) -> bool {
        if self.state == SchedulerState::ShuttingDown {
            return true;
        }
        self.state = SchedulerState::ShuttingDown;
        self.commands.close();
        if let Some(worker) = self.clock.take_worker() {
            self.workers.push(worker);
        }
        info!(workers = self.workers.len(), "frame scheduler shutting down");

        for worker in &self.workers {
            worker.request_stop();
        }
        let deadline = Instant::now() + self.config.shutdown_timeout();
        let mut detached = 0;
        for worker in self.workers.drain(..) {
            if !worker.stop_and_join(deadline.saturating_duration_since(Instant::now())) {
                detached += 1;
            }
        }
        if detached > 0 {
            warn!(detached, "producers did not stop in time");
        }
        detached == 0
    }

    fn apply_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::SelectScene {
                deck,
                category,
                index,
            } => match self.decks[deck.index()].select_scene(category, index) {
                Ok(()) => {
                    let scene = self.decks[deck.index()].scene();
                    info!(
                        deck = deck.label(),
                        scene = scene.identifier(),
                        name = self.registry.name(scene),
                        "scene selected"
                    );
                }
                Err(error) => debug!(%error, deck = deck.label(), category, index, "dropping scene selection"),
            },
            Command::SetCrossfade(value) => {
                if value.is_finite() {
                    self.mix.crossfade = value.clamp(0.0, 1.0);
                } else {
                    debug!(value, "dropping non-finite crossfade");
                }
            }
            Command::CycleEffect(direction) => {
                self.mix.effect_index = cycle_index(self.mix.effect_index, direction);
                info!(effect = effect_name(self.mix.effect_index), "effect selected");
            }
            Command::SetEffectIntensity(value) => {
                if value.is_finite() {
                    self.mix.effect_intensity = value.clamp(0.0, 1.0);
                } else {
                    debug!(value, "dropping non-finite effect intensity");
                }
            }
            Command::SetParameter { deck, slot, value } => {
                if let Err(error) = self.decks[deck.index()].set_parameter(slot, value) {
                    debug!(%error, deck = deck.label(), slot, "dropping parameter change");
                }
            }
            Command::ToggleClockSource => {
                self.clock.toggle(now);
            }
            Command::SetTempo(bpm) => {
                if (MIN_BPM..=MAX_BPM).contains(&bpm) {
                    self.clock.set_tempo(bpm, now);
                } else {
                    debug!(bpm, "dropping out-of-range tempo");
                }
            }
            Command::SetPlaying(playing) => self.clock.set_playing(playing),
            Command::ResetTransport => self.clock.reset_transport(now),
            Command::SetOverlay { deck, update } => self.overlays.apply(deck, &update),
            Command::Resize { width, height } => self.resize(width, height),
        }
    }

    fn resize(&mut self, width: usize, height: usize) {
        if width == 0 || height == 0 {
            debug!(width, height, "dropping empty resize");
            return;
        }
        if (width, height) == (self.width, self.height) {
            return;
        }
        self.width = width;
        self.height = height;
        self.frame.resize(width, height);
        self.effects.reset();
        info!(width, height, "frame resized");
    }

    fn invalid_state(&self, expected: &'static str) -> CliftError {
        CliftError::InvalidState {
            expected,
            actual: self.state.label(),
        }
    }
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("state", &self.state)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("mix", &self.mix)
            .field("clock", &self.clock)
            .field("frame_index", &self.frame_index)
            .field("workers", &self.workers.len())
            .finish()
    }
}

fn effect_name(index: usize) -> &'static str {
    EffectKind::from_index(index)
        .map(EffectKind::name)
        .unwrap_or("?")
}

/// Deadline of the tick after `deadline`. When `now` is already past it,
/// whole periods are skipped instead of queued; returns the deadline and
/// the number of ticks skipped.
fn next_deadline(deadline: Instant, now: Instant, period: Duration) -> (Instant, u64) {
    let next = deadline + period;
    if now <= next {
        return (next, 0);
    }
    let behind = (now - next).as_nanos();
    let skipped = (behind / period.as_nanos().max(1)) as u64 + 1;
    (next + period * skipped.min(u32::MAX as u64) as u32, skipped)
}
