//! Demo scenes for the binary. Scene `(0, n)` is selected with key `n + 1`.

use std::f32::consts::TAU;

use clift_core::{
    frame::{Attributes, Cell, FrameBuffer, DENSITY_RAMP},
    scene::{SceneContext, SceneId, SceneRegistry},
};
use rand::{rngs::SmallRng, Rng, SeedableRng};

type SceneRender = fn(&SceneContext<'_>) -> FrameBuffer;

const SCENES: [(&str, bool, SceneRender); 5] = [
    ("plasma", false, plasma),
    ("spectrum", false, spectrum),
    ("tunnel", true, tunnel),
    ("pulse-grid", true, pulse_grid),
    ("starfield", false, starfield),
];

pub const DEMO_SCENES: usize = SCENES.len();

const STARFIELD_SEED: u64 = 0x5eed_57a2;

pub fn registry() -> SceneRegistry {
    let mut registry = SceneRegistry::new();
    for (index, (name, beat_locked, render)) in SCENES.into_iter().enumerate() {
        if let Some(id) = SceneId::new(0, index) {
            registry.register(id, name, beat_locked, render);
        }
    }
    registry
}

fn ramp(value: f32) -> char {
    let top = DENSITY_RAMP.len() - 1;
    DENSITY_RAMP[(value.clamp(0.0, 1.0) * top as f32).round() as usize]
}

/// Rainbow through the 6x6x6 colour cube, `t` wraps at 1.
fn hue(t: f32) -> u8 {
    let t = t.rem_euclid(1.0) * 6.0;
    let rise = ((t.fract() * 5.0).round()) as u8;
    let fall = 5 - rise;
    let (r, g, b) = match t as u8 {
        0 => (5, rise, 0),
        1 => (fall, 5, 0),
        2 => (0, 5, rise),
        3 => (0, fall, 5),
        4 => (rise, 0, 5),
        _ => (5, 0, fall),
    };
    16 + 36 * r + 6 * g + b
}

fn plasma(context: &SceneContext<'_>) -> FrameBuffer {
    let mut frame = FrameBuffer::new(context.width, context.height);
    let t = context.elapsed_time as f32;
    let scale = 0.05 + context.parameters[0] * 0.2;
    let boost = 0.8 + context.audio.bass;

    for y in 0..context.height {
        for x in 0..context.width {
            let fx = x as f32 * scale;
            let fy = y as f32 * scale * 2.0;
            let v = (fx + t).sin()
                + (fy - t * 0.7).sin()
                + ((fx + fy) * 0.5 + t * 1.3).sin()
                + ((fx * fx + fy * fy).sqrt() - t).sin();
            let v = (v / 4.0 + 1.0) * 0.5;
            frame.set(x, y, Cell::new(ramp(v * boost), hue(v + t * 0.05)));
        }
    }
    frame
}

fn spectrum(context: &SceneContext<'_>) -> FrameBuffer {
    let mut frame = FrameBuffer::new(context.width, context.height);
    let bands = context.audio.spectrum.len();
    let height = context.height as f32;

    for x in 0..context.width {
        let band = x * bands / context.width.max(1);
        let level = context.audio.spectrum[band.min(bands - 1)];
        let bar = (level * height).round() as usize;
        for step in 0..bar.min(context.height) {
            let y = context.height - 1 - step;
            let mut cell = Cell::new(ramp(0.4 + level * 0.6), hue(step as f32 / height * 0.35));
            if context.audio.beat_triggered {
                cell = cell.with_attrs(Attributes::BOLD);
            }
            frame.set(x, y, cell);
        }
    }
    frame
}

fn tunnel(context: &SceneContext<'_>) -> FrameBuffer {
    let mut frame = FrameBuffer::new(context.width, context.height);
    let t = context.elapsed_time as f32;
    let (cx, cy) = (context.width as f32 / 2.0, context.height as f32 / 2.0);
    let pulse = 1.0 - 0.5 * context.clock.phase as f32;
    let twist = context.parameters[1] * 4.0;

    for y in 0..context.height {
        for x in 0..context.width {
            let dx = x as f32 - cx;
            let dy = (y as f32 - cy) * 2.0;
            let distance = (dx * dx + dy * dy).sqrt();
            let angle = dy.atan2(dx) / TAU;
            let ring = (distance * 0.15 - t * 2.0 + angle * twist).rem_euclid(1.0);
            let value = (1.0 - ring) * pulse;
            frame.set(x, y, Cell::new(ramp(value), hue(angle + distance * 0.01)));
        }
    }
    frame
}

fn pulse_grid(context: &SceneContext<'_>) -> FrameBuffer {
    let mut frame = FrameBuffer::new(context.width, context.height);
    let fade = 1.0 - context.clock.phase as f32;
    let downbeat = context.clock.bar_phase < 1.0 / context.clock.quantum.max(1.0);
    let colour = if downbeat { 196 } else { 45 };
    let spacing = 4 + (context.parameters[2] * 8.0) as usize;

    for y in 0..context.height {
        for x in 0..context.width {
            let column = x % (spacing * 2) == 0;
            let row = y % spacing == 0;
            let glyph = match (column, row) {
                (true, true) => '+',
                (true, false) => '|',
                (false, true) => '-',
                (false, false) => ramp(context.audio.volume * fade * 0.5),
            };
            if glyph != ' ' {
                let cell = Cell::new(glyph, colour);
                let attrs = if fade > 0.5 { Attributes::BOLD } else { Attributes::DIM };
                frame.set(x, y, cell.with_attrs(attrs));
            }
        }
    }
    frame
}

fn starfield(context: &SceneContext<'_>) -> FrameBuffer {
    let mut frame = FrameBuffer::new(context.width, context.height);
    if context.width == 0 || context.height == 0 {
        return frame;
    }
    let t = context.elapsed_time as f32;
    let (cx, cy) = (context.width as f32 / 2.0, context.height as f32 / 2.0);
    let count = 40 + (context.parameters[3] * 160.0) as usize;
    let speed = 0.2 + context.audio.volume * 0.8;

    // Same seed every frame: each star keeps its heading and pace.
    let mut rng = SmallRng::seed_from_u64(STARFIELD_SEED);
    for _ in 0..count {
        let angle = rng.random::<f32>() * TAU;
        let start: f32 = rng.random();
        let pace: f32 = rng.random();
        let depth = (start + t * speed * (0.5 + pace)).rem_euclid(1.0);
        let x = cx + angle.cos() * depth * cx * 1.4;
        let y = cy + angle.sin() * depth * cy * 1.4;
        if x < 0.0 || y < 0.0 {
            continue;
        }
        frame.set(x as usize, y as usize, Cell::new(ramp(0.3 + depth * 0.7), 255 - (depth * 8.0) as u8));
    }
    frame
}
