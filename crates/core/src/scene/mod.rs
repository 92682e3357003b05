use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{analysis::AudioFeatures, clock::ClockState, frame::FrameBuffer};

pub const CATEGORY_COUNT: usize = 19;
pub const SCENES_PER_CATEGORY: usize = 10;
pub const SCENE_COUNT: usize = CATEGORY_COUNT * SCENES_PER_CATEGORY;
pub const PARAMETER_SLOTS: usize = 8;

/// Address of a scene: `(category, index)`, flattened to
/// `category * 10 + index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SceneId {
    category: u8,
    index: u8,
}

impl SceneId {
    /// Returns `None` unless `category < 19` and `index < 10`.
    pub fn new(category: usize, index: usize) -> Option<Self> {
        if category < CATEGORY_COUNT && index < SCENES_PER_CATEGORY {
            Some(Self {
                category: category as u8,
                index: index as u8,
            })
        } else {
            None
        }
    }

    /// Inverse of [`identifier`](Self::identifier).
    pub fn from_identifier(identifier: usize) -> Option<Self> {
        Self::new(identifier / SCENES_PER_CATEGORY, identifier % SCENES_PER_CATEGORY)
            .filter(|_| identifier < SCENE_COUNT)
    }

    pub fn category(self) -> usize {
        self.category as usize
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    /// Flat scene number `category * 10 + index`, in [0, 190).
    pub fn identifier(self) -> usize {
        self.category() * SCENES_PER_CATEGORY + self.index()
    }
}

impl Default for SceneId {
    fn default() -> Self {
        Self {
            category: 0,
            index: 0,
        }
    }
}

/// Everything a scene may look at. Stable for the duration of one render.
#[derive(Debug, Clone, Copy)]
pub struct SceneContext<'a> {
    pub scene: SceneId,
    pub width: usize,
    pub height: usize,
    pub elapsed_time: f64,
    pub parameters: &'a [f32; PARAMETER_SLOTS],
    pub audio: &'a AudioFeatures,
    pub clock: &'a ClockState,
}

/// A scene: a pure function from context to a frame of
/// `context.width x context.height`.
pub type SceneFn = dyn Fn(&SceneContext<'_>) -> FrameBuffer + Send + Sync;

#[derive(Clone)]
pub struct SceneDescriptor {
    pub name: String,
    /// Animate on beat-derived time when the clock is network-synced.
    pub beat_locked: bool,
    render: Arc<SceneFn>,
}

impl fmt::Debug for SceneDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SceneDescriptor")
            .field("name", &self.name)
            .field("beat_locked", &self.beat_locked)
            .finish()
    }
}

/// Table of scenes keyed by identifier. Empty slots render blank frames.
#[derive(Debug, Clone)]
pub struct SceneRegistry {
    scenes: Vec<Option<SceneDescriptor>>,
}

impl SceneRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            scenes: vec![None; SCENE_COUNT],
        }
    }

    /// Adds or replaces the scene at `id`.
    pub fn register<F>(&mut self, id: SceneId, name: impl Into<String>, beat_locked: bool, render: F)
    where
        F: Fn(&SceneContext<'_>) -> FrameBuffer + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(scene = id.identifier(), %name, "registered scene");
        self.scenes[id.identifier()] = Some(SceneDescriptor {
            name,
            beat_locked,
            render: Arc::new(render),
        });
    }

    pub fn get(&self, id: SceneId) -> Option<&SceneDescriptor> {
        self.scenes[id.identifier()].as_ref()
    }

    /// Whether the scene animates on beat time while networked.
    pub fn is_beat_locked(&self, id: SceneId) -> bool {
        self.get(id).map(|scene| scene.beat_locked).unwrap_or(false)
    }

    pub fn name(&self, id: SceneId) -> &str {
        self.get(id).map(|scene| scene.name.as_str()).unwrap_or("empty")
    }

    pub fn len(&self) -> usize {
        self.scenes.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Renders `context.scene`. Unregistered scenes render blank.
    pub fn render(&self, context: &SceneContext<'_>) -> FrameBuffer {
        match self.get(context.scene) {
            Some(scene) => (scene.render)(context),
            None => FrameBuffer::new(context.width, context.height),
        }
    }
}

impl Default for SceneRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Cell;

    #[test]
    fn identifiers_cover_the_grid() {
        let last = SceneId::new(18, 9).unwrap();
        assert_eq!(last.identifier(), 189);
        assert_eq!(SceneId::from_identifier(42), SceneId::new(4, 2));
        assert!(SceneId::new(19, 0).is_none());
        assert!(SceneId::new(0, 10).is_none());
        assert!(SceneId::from_identifier(190).is_none());
    }

    #[test]
    fn renders_registered_and_blank_scenes() {
        let mut registry = SceneRegistry::new();
        let id = SceneId::new(1, 3).unwrap();
        registry.register(id, "hash", true, |context| {
            FrameBuffer::filled(context.width, context.height, Cell::new('#', 2))
        });

        let audio = AudioFeatures::default();
        let clock = ClockState::default();
        let parameters = [0.0; PARAMETER_SLOTS];
        let mut context = SceneContext {
            scene: id,
            width: 3,
            height: 2,
            elapsed_time: 0.0,
            parameters: &parameters,
            audio: &audio,
            clock: &clock,
        };

        assert_eq!(registry.render(&context).to_text(), "###\n###\n");
        assert!(registry.is_beat_locked(id));
        assert_eq!(registry.name(id), "hash");

        context.scene = SceneId::default();
        assert!(registry.render(&context).cells().iter().all(Cell::is_blank));
        assert_eq!(registry.len(), 1);
    }
}
