use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    analysis::AudioFeatures,
    clock::{ClockMode, ClockState},
    frame::FrameBuffer,
    scene::{SceneContext, SceneId, SceneRegistry, PARAMETER_SLOTS},
    CliftError, Result,
};

/// Animation seconds per beat for beat-locked scenes (120 BPM reference).
pub const SECONDS_PER_LOCKED_BEAT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeckId {
    A,
    B,
}

impl DeckId {
    pub const ALL: [DeckId; 2] = [DeckId::A, DeckId::B];

    /// Maps the overlay protocol's `player` number (0 = A, 1 = B).
    pub fn from_player(player: u64) -> Option<Self> {
        match player {
            0 => Some(DeckId::A),
            1 => Some(DeckId::B),
            _ => None,
        }
    }

    /// Position of the deck in per-deck arrays.
    pub fn index(self) -> usize {
        match self {
            DeckId::A => 0,
            DeckId::B => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            DeckId::A => "A",
            DeckId::B => "B",
        }
    }
}

/// Playback state of one scene player.
#[derive(Debug, Clone, PartialEq)]
pub struct Deck {
    id: DeckId,
    scene: SceneId,
    elapsed_time: f64,
    parameters: [f32; PARAMETER_SLOTS],
    last_beat: Option<f64>,
}

impl Deck {
    /// Creates a deck on scene `(0, 0)` with every parameter centred.
    pub fn new(id: DeckId) -> Self {
        Self {
            id,
            scene: SceneId::default(),
            elapsed_time: 0.0,
            parameters: [0.5; PARAMETER_SLOTS],
            last_beat: None,
        }
    }

    /// Returns which of the two decks this is.
    pub fn id(&self) -> DeckId {
        self.id
    }

    /// Returns the scene rendered on the next tick.
    pub fn scene(&self) -> SceneId {
        self.scene
    }

    /// Returns the animation time handed to the scene, in seconds.
    pub fn elapsed_time(&self) -> f64 {
        self.elapsed_time
    }

    /// Returns the parameter vector handed to the scene.
    pub fn parameters(&self) -> &[f32; PARAMETER_SLOTS] {
        &self.parameters
    }

    /// Points the deck at another scene. It takes effect on the next render.
    pub fn select_scene(&mut self, category: usize, index: usize) -> Result<()> {
        self.scene = SceneId::new(category, index)
            .ok_or(CliftError::InvalidInput("scene selector out of range"))?;
        Ok(())
    }

    /// Stores `value`, clamped to [0, 1], in parameter `slot`.
    pub fn set_parameter(&mut self, slot: usize, value: f32) -> Result<()> {
        if !value.is_finite() {
            return Err(CliftError::InvalidInput("parameter value must be finite"));
        }
        let target = self
            .parameters
            .get_mut(slot)
            .ok_or(CliftError::InvalidInput("parameter slot out of range"))?;
        *target = value.clamp(0.0, 1.0);
        Ok(())
    }

    /// Moves the animation forward. Beat-locked scenes follow the beat grid
    /// while the clock is network-synced, everything else follows wall time.
    pub fn advance(&mut self, dt: Duration, clock: &ClockState, beat_locked: bool) {
        let follow_beat = beat_locked && clock.source == ClockMode::NetworkSynced;
        let step = match (follow_beat, self.last_beat) {
            (true, Some(last)) => (clock.beat_position - last).max(0.0) * SECONDS_PER_LOCKED_BEAT,
            _ => dt.as_secs_f64(),
        };
        self.elapsed_time += step;
        self.last_beat = Some(clock.beat_position);
    }

    /// Asks the scene collaborator for this deck's frame.
    pub fn render(
        &self,
        registry: &SceneRegistry,
        audio: &AudioFeatures,
        clock: &ClockState,
        width: usize,
        height: usize,
    ) -> Result<FrameBuffer> {
        let context = SceneContext {
            scene: self.scene,
            width,
            height,
            elapsed_time: self.elapsed_time,
            parameters: &self.parameters,
            audio,
            clock,
        };

        let frame = registry.render(&context);
        if frame.dimensions() != (width, height) {
            return Err(CliftError::DimensionMismatch {
                left_width: width,
                left_height: height,
                right_width: frame.width(),
                right_height: frame.height(),
            });
        }
        Ok(frame)
    }
}
