//! Core library for the clift terminal visual engine.
//!
//! Two decks of procedural scenes are rendered into character frames,
//! crossfaded, run through one post effect and topped with overlay text,
//! once per tick. Audio analysis, the musical clock and the overlay
//! listener run as producers that feed the tick loop through bounded
//! hand-off points.

pub mod analysis;
pub mod audio;
pub mod clock;
pub mod command;
pub mod compositor;
pub mod config;
pub mod deck;
pub mod effects;
pub mod error;
pub mod frame;
pub mod overlay;
pub mod scene;
pub mod scheduler;
pub mod worker;

pub use analysis::{AudioFeatureExtractor, AudioFeatures, FeatureSlot};
pub use audio::{spawn_test_signal, AudioFeed, AudioProducer, TestSignal};
pub use clock::{ClockMode, ClockSelector, ClockSource, ClockState, LocalClock, NetworkClock};
pub use command::{Command, CommandBatch, CommandQueue, CommandSender, Direction};
pub use compositor::blend;
pub use config::{AppConfig, AudioConfig, ClockConfig, OverlayConfig, SchedulerConfig};
pub use deck::{Deck, DeckId};
pub use effects::{EffectChain, EffectKind, EffectParams};
pub use error::{CliftError, Result};
pub use frame::{Attributes, Cell, FrameBuffer};
pub use overlay::{parse_overlay_message, OverlayServer, OverlayState, OverlayUpdate, Overlays};
pub use scene::{SceneContext, SceneDescriptor, SceneId, SceneRegistry};
pub use scheduler::{FrameScheduler, FrameSink, MixState, SchedulerState};
pub use worker::{StopSignal, Worker};
