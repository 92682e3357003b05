use std::collections::VecDeque;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    command::Direction,
    frame::{Attributes, Cell, FrameBuffer, DENSITY_RAMP},
};

pub const EFFECT_COUNT: usize = 15;

/// Frames of history kept by the trail effect.
pub const TRAIL_DEPTH: usize = 4;

const TOP_LEVEL: usize = DENSITY_RAMP.len() - 1;
const GLITCH_HOLD_FRAMES: u64 = 3;
const GLITCH_BAND_HEIGHT: usize = 2;

/// The fixed registry of post-processing effects, in cycling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    None,
    Invert,
    Edge,
    Scanlines,
    ChromaShift,
    Pixelate,
    GlitchBlocks,
    Trail,
    MirrorHorizontal,
    MirrorVertical,
    Kaleidoscope,
    Wave,
    Posterize,
    Strobe,
    Noise,
}

impl EffectKind {
    pub const ALL: [EffectKind; EFFECT_COUNT] = [
        EffectKind::None,
        EffectKind::Invert,
        EffectKind::Edge,
        EffectKind::Scanlines,
        EffectKind::ChromaShift,
        EffectKind::Pixelate,
        EffectKind::GlitchBlocks,
        EffectKind::Trail,
        EffectKind::MirrorHorizontal,
        EffectKind::MirrorVertical,
        EffectKind::Kaleidoscope,
        EffectKind::Wave,
        EffectKind::Posterize,
        EffectKind::Strobe,
        EffectKind::Noise,
    ];

    /// Looks up the effect at `index` in cycling order.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Short name for the status line.
    pub fn name(self) -> &'static str {
        match self {
            EffectKind::None => "none",
            EffectKind::Invert => "invert",
            EffectKind::Edge => "edge",
            EffectKind::Scanlines => "scanlines",
            EffectKind::ChromaShift => "chroma-shift",
            EffectKind::Pixelate => "pixelate",
            EffectKind::GlitchBlocks => "glitch-blocks",
            EffectKind::Trail => "trail",
            EffectKind::MirrorHorizontal => "mirror-h",
            EffectKind::MirrorVertical => "mirror-v",
            EffectKind::Kaleidoscope => "kaleidoscope",
            EffectKind::Wave => "wave",
            EffectKind::Posterize => "posterize",
            EffectKind::Strobe => "strobe",
            EffectKind::Noise => "noise",
        }
    }
}

/// Next effect index in `direction`, wrapping at both ends.
pub fn cycle_index(index: usize, direction: Direction) -> usize {
    let index = index % EFFECT_COUNT;
    match direction {
        Direction::Forward => (index + 1) % EFFECT_COUNT,
        Direction::Backward => (index + EFFECT_COUNT - 1) % EFFECT_COUNT,
    }
}

/// Per-frame inputs shared by every effect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectParams {
    /// Strength in [0, 1]. Effects without a notion of strength ignore it.
    pub intensity: f32,
    /// Seconds since the scheduler started.
    pub time: f64,
    pub beat: f64,
    pub beat_triggered: bool,
    /// Tick counter, seeds the deterministic noise of glitch and noise.
    pub frame: u64,
}

impl EffectParams {
    fn strength(&self) -> f32 {
        if self.intensity.is_nan() {
            0.0
        } else {
            self.intensity.clamp(0.0, 1.0)
        }
    }
}

impl Default for EffectParams {
    fn default() -> Self {
        Self {
            intensity: 1.0,
            time: 0.0,
            beat: 0.0,
            beat_triggered: false,
            frame: 0,
        }
    }
}

/// Applies the selected effect to the composited frame.
///
/// History is owned by the chain on behalf of the trail effect and is
/// dropped whenever a different effect is selected, so no effect ever sees
/// frames produced while another one was active.
#[derive(Debug, Default)]
pub struct EffectChain {
    selected: Option<EffectKind>,
    history: VecDeque<FrameBuffer>,
}

impl EffectChain {
    /// Creates a chain with nothing selected and no history.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected(&self) -> Option<EffectKind> {
        self.selected
    }

    /// Number of past frames held for the trail effect.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Forgets all history, e.g. after a resize.
    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Out-of-range indices wrap around the registry.
    pub fn apply(&mut self, frame: &FrameBuffer, index: usize, params: &EffectParams) -> FrameBuffer {
        let kind = EffectKind::ALL[index % EFFECT_COUNT];
        if self.selected != Some(kind) {
            if !self.history.is_empty() {
                debug!(from = ?self.selected, to = kind.name(), "effect changed, dropping history");
            }
            self.history.clear();
            self.selected = Some(kind);
        }

        let strength = params.strength();
        match kind {
            EffectKind::None => frame.clone(),
            EffectKind::Invert => invert(frame),
            EffectKind::Edge => edge(frame, strength),
            EffectKind::Scanlines => scanlines(frame, strength),
            EffectKind::ChromaShift => chroma_shift(frame, strength),
            EffectKind::Pixelate => pixelate(frame, strength),
            EffectKind::GlitchBlocks => glitch_blocks(frame, params, strength),
            EffectKind::Trail => self.echo(frame, strength),
            EffectKind::MirrorHorizontal => {
                let width = frame.width();
                remap(frame, |x, y| (x.min(width - 1 - x), y))
            }
            EffectKind::MirrorVertical => {
                let height = frame.height();
                remap(frame, |x, y| (x, y.min(height - 1 - y)))
            }
            EffectKind::Kaleidoscope => {
                let (width, height) = frame.dimensions();
                remap(frame, |x, y| (x.min(width - 1 - x), y.min(height - 1 - y)))
            }
            EffectKind::Wave => wave(frame, params, strength),
            EffectKind::Posterize => posterize(frame, strength),
            EffectKind::Strobe => strobe(frame, params, strength),
            EffectKind::Noise => noise(frame, params, strength),
        }
    }

    /// Fills empty cells with fading copies of the previous frames.
    fn echo(&mut self, frame: &FrameBuffer, strength: f32) -> FrameBuffer {
        if self
            .history
            .front()
            .is_some_and(|past| !past.same_dimensions(frame))
        {
            self.history.clear();
        }

        let depth = (strength * TRAIL_DEPTH as f32).ceil() as usize;
        let mut out = frame.clone();
        for (i, cell) in out.cells_mut().iter_mut().enumerate() {
            if !cell.is_blank() {
                continue;
            }
            for (age, past) in self.history.iter().take(depth).enumerate() {
                let echo = past.cells()[i];
                if echo.is_blank() {
                    continue;
                }
                let glyph = match ramp_level(echo.glyph) {
                    Some(level) => DENSITY_RAMP[level.saturating_sub(age + 1)],
                    None if age == 0 => echo.glyph,
                    None => '.',
                };
                if glyph != ' ' {
                    *cell = Cell::new(glyph, echo.fg).with_attrs(Attributes::DIM);
                }
                break;
            }
        }

        self.history.push_front(frame.clone());
        self.history.truncate(TRAIL_DEPTH);
        out
    }
}

fn ramp_level(glyph: char) -> Option<usize> {
    DENSITY_RAMP.iter().position(|ramp| *ramp == glyph)
}

fn with_level(cell: Cell, level: usize) -> Cell {
    Cell {
        glyph: DENSITY_RAMP[level.min(TOP_LEVEL)],
        ..cell
    }
}

/// Rewrites every cell in place given its coordinates.
fn map_cells(frame: &FrameBuffer, f: impl Fn(usize, usize, Cell) -> Cell) -> FrameBuffer {
    let width = frame.width();
    let mut out = frame.clone();
    for (i, cell) in out.cells_mut().iter_mut().enumerate() {
        *cell = f(i % width, i / width, *cell);
    }
    out
}

/// Builds a frame by reading each output cell from a source position.
fn remap(frame: &FrameBuffer, source: impl Fn(usize, usize) -> (usize, usize)) -> FrameBuffer {
    map_cells(frame, |x, y, _| {
        let (sx, sy) = source(x, y);
        frame.get(sx, sy).copied().unwrap_or(Cell::BLANK)
    })
}

fn invert(frame: &FrameBuffer) -> FrameBuffer {
    map_cells(frame, |_, _, mut cell| match ramp_level(cell.glyph) {
        Some(level) => with_level(cell, TOP_LEVEL - level),
        None => {
            if cell.attrs.contains(Attributes::REVERSE) {
                cell.attrs.remove(Attributes::REVERSE);
            } else {
                cell.attrs.insert(Attributes::REVERSE);
            }
            cell
        }
    })
}

fn edge(frame: &FrameBuffer, strength: f32) -> FrameBuffer {
    let threshold = 1 + ((1.0 - strength) * 3.0).round() as usize;
    let (width, height) = frame.dimensions();
    let level = |x: usize, y: usize| frame.get(x, y).map(Cell::density).unwrap_or(0);

    map_cells(frame, |x, y, cell| {
        let here = level(x, y);
        let across = x + 1 < width && here.abs_diff(level(x + 1, y)) >= threshold;
        let down = y + 1 < height && here.abs_diff(level(x, y + 1)) >= threshold;
        let glyph = match (across, down) {
            (true, true) => '+',
            (true, false) => '|',
            (false, true) => '-',
            (false, false) => return Cell::BLANK,
        };
        Cell::new(glyph, cell.fg).with_attrs(Attributes::BOLD)
    })
}

fn scanlines(frame: &FrameBuffer, strength: f32) -> FrameBuffer {
    let drop = (strength * TOP_LEVEL as f32).round() as usize;
    map_cells(frame, |_, y, cell| {
        if y % 2 == 0 {
            return cell;
        }
        let dimmed = match ramp_level(cell.glyph) {
            Some(level) => with_level(cell, level.saturating_sub(drop)),
            None => cell,
        };
        dimmed.with_attrs(cell.attrs | Attributes::DIM)
    })
}

/// Colour fringing: each cell borrows the colour of the cell a few columns
/// to its left, and empty cells next to content pick up a faint ghost.
fn chroma_shift(frame: &FrameBuffer, strength: f32) -> FrameBuffer {
    let shift = 1 + (strength * 3.0).round() as usize;
    map_cells(frame, |x, y, cell| {
        let source = x.checked_sub(shift).and_then(|sx| frame.get(sx, y));
        match source {
            Some(source) if !source.is_blank() && cell.is_blank() => {
                Cell::new('.', source.fg).with_attrs(Attributes::DIM)
            }
            Some(source) if !source.is_blank() => Cell {
                fg: source.fg,
                ..cell
            },
            _ => cell,
        }
    })
}

fn pixelate(frame: &FrameBuffer, strength: f32) -> FrameBuffer {
    let block = 1 + (strength * 7.0).round() as usize;
    remap(frame, |x, y| (x - x % block, y - y % block))
}

fn glitch_blocks(frame: &FrameBuffer, params: &EffectParams, strength: f32) -> FrameBuffer {
    let (width, height) = frame.dimensions();
    if width == 0 || strength <= 0.0 {
        return frame.clone();
    }

    let epoch = params.frame / GLITCH_HOLD_FRAMES;
    let chance = if params.beat_triggered {
        strength
    } else {
        strength * 0.35
    };
    let max_offset = (width / 4).max(1);

    // Seeded per epoch so a glitch holds still for a few frames.
    let mut rng = SmallRng::seed_from_u64(epoch);
    let mut out = frame.clone();
    for band in 0..height.div_ceil(GLITCH_BAND_HEIGHT) {
        let roll: f32 = rng.random();
        let offset = rng.random_range(1..=max_offset);
        let tint = rng.random_range(16..232_u8);
        if roll >= chance {
            continue;
        }

        let rows = band * GLITCH_BAND_HEIGHT..((band + 1) * GLITCH_BAND_HEIGHT).min(height);
        for y in rows {
            let source = frame.row(y);
            for (x, cell) in out.row_mut(y).iter_mut().enumerate() {
                *cell = source[(x + width - offset % width) % width];
                cell.fg = tint;
            }
        }
    }
    out
}

fn wave(frame: &FrameBuffer, params: &EffectParams, strength: f32) -> FrameBuffer {
    let width = frame.width() as isize;
    let amplitude = strength as f64 * 4.0;
    remap(frame, |x, y| {
        let offset = (amplitude * (y as f64 * 0.6 + params.time * 4.0).sin()).round() as isize;
        ((x as isize - offset).rem_euclid(width) as usize, y)
    })
}

fn posterize(frame: &FrameBuffer, strength: f32) -> FrameBuffer {
    let levels = 2 + ((1.0 - strength) * 4.0).round() as usize;
    let step = TOP_LEVEL as f32 / (levels - 1) as f32;
    map_cells(frame, |_, _, cell| match ramp_level(cell.glyph) {
        Some(level) => with_level(cell, ((level as f32 / step).round() * step).round() as usize),
        None => cell,
    })
}

/// Flashes the whole frame at the start of each beat.
fn strobe(frame: &FrameBuffer, params: &EffectParams, strength: f32) -> FrameBuffer {
    let window = strength as f64 * 0.25;
    let flash = strength > 0.0 && (params.beat_triggered || params.beat.rem_euclid(1.0) < window);
    if !flash {
        return frame.clone();
    }
    map_cells(frame, |_, _, cell| {
        cell.with_attrs(cell.attrs | Attributes::REVERSE | Attributes::BOLD)
    })
}

fn noise(frame: &FrameBuffer, params: &EffectParams, strength: f32) -> FrameBuffer {
    let chance = strength * 0.15;
    let mut rng = SmallRng::seed_from_u64(params.frame);
    let mut out = frame.clone();
    for cell in out.cells_mut() {
        let roll: f32 = rng.random();
        let glyph = DENSITY_RAMP[rng.random_range(0..DENSITY_RAMP.len())];
        if roll < chance {
            cell.glyph = glyph;
        }
    }
    out
}
