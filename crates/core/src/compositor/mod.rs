//! Deck crossfading.
//!
//! Character cells cannot be partially mixed, so every output cell is taken
//! whole from one deck. A cell comes from deck B iff the crossfade reaches
//! that cell's entry in an ordered 8x8 dither matrix. The pattern is fixed,
//! so the same inputs always give the same frame and raising the crossfade
//! only ever flips cells from A to B.

use crate::{frame::FrameBuffer, CliftError, Result};

pub const DITHER_SIZE: usize = 8;

/// Ordered (Bayer) dither ranks, 0..64.
const BAYER_8X8: [[u8; DITHER_SIZE]; DITHER_SIZE] = [
    [0, 32, 8, 40, 2, 34, 10, 42],
    [48, 16, 56, 24, 50, 18, 58, 26],
    [12, 44, 4, 36, 14, 46, 6, 38],
    [60, 28, 52, 20, 62, 30, 54, 22],
    [3, 35, 11, 43, 1, 33, 9, 41],
    [51, 19, 59, 27, 49, 17, 57, 25],
    [15, 47, 7, 39, 13, 45, 5, 37],
    [63, 31, 55, 23, 61, 29, 53, 21],
];

/// Crossfade at which the cell at `(x, y)` switches to deck B, in (0, 1).
pub fn dither_threshold(x: usize, y: usize) -> f32 {
    let rank = BAYER_8X8[y % DITHER_SIZE][x % DITHER_SIZE];
    (rank as f32 + 0.5) / (DITHER_SIZE * DITHER_SIZE) as f32
}

/// Blends two equally sized frames. `crossfade` 0 shows `a`, 1 shows `b`.
pub fn blend(a: &FrameBuffer, b: &FrameBuffer, crossfade: f32) -> Result<FrameBuffer> {
    if !a.same_dimensions(b) {
        return Err(CliftError::DimensionMismatch {
            left_width: a.width(),
            left_height: a.height(),
            right_width: b.width(),
            right_height: b.height(),
        });
    }

    let crossfade = if crossfade.is_nan() { 0.0 } else { crossfade };
    if crossfade <= 0.0 {
        return Ok(a.clone());
    }
    if crossfade >= 1.0 {
        return Ok(b.clone());
    }

    let mut out = a.clone();
    for y in 0..a.height() {
        let from_b = b.row(y);
        for (x, cell) in out.row_mut(y).iter_mut().enumerate() {
            if crossfade >= dither_threshold(x, y) {
                *cell = from_b[x];
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Cell;

    fn pair(width: usize, height: usize) -> (FrameBuffer, FrameBuffer) {
        (
            FrameBuffer::filled(width, height, Cell::new('#', 1)),
            FrameBuffer::filled(width, height, Cell::new('.', 2)),
        )
    }

    #[test]
    fn endpoints_select_whole_frames() {
        let (a, b) = pair(13, 7);
        assert_eq!(blend(&a, &b, 0.0).unwrap(), a);
        assert_eq!(blend(&a, &b, -3.0).unwrap(), a);
        assert_eq!(blend(&a, &b, 1.0).unwrap(), b);
        assert_eq!(blend(&a, &b, 4.0).unwrap(), b);
        assert_eq!(blend(&a, &b, f32::NAN).unwrap(), a);
    }

    #[test]
    fn blending_is_deterministic() {
        let (a, b) = pair(21, 9);
        for step in 0..=20 {
            let crossfade = step as f32 / 20.0;
            assert_eq!(blend(&a, &b, crossfade).unwrap(), blend(&a, &b, crossfade).unwrap());
        }
    }

    #[test]
    fn half_crossfade_takes_half_of_each_tile() {
        let (a, b) = pair(16, 8);
        let out = blend(&a, &b, 0.5).unwrap();

        let from_b = out.cells().iter().filter(|cell| cell.glyph == '.').count();
        assert_eq!(from_b, out.cells().len() / 2);
        for y in 0..8 {
            for x in 0..16 {
                let expected = if BAYER_8X8[y % 8][x % 8] < 32 { '.' } else { '#' };
                assert_eq!(out.get(x, y).unwrap().glyph, expected);
            }
        }
    }

    #[test]
    fn raising_crossfade_only_adds_cells_from_b() {
        let (a, b) = pair(10, 10);
        let mut previous = blend(&a, &b, 0.0).unwrap();
        for step in 1..=64 {
            let next = blend(&a, &b, step as f32 / 64.0).unwrap();
            for (before, after) in previous.cells().iter().zip(next.cells()) {
                assert!(before.glyph == '#' || after.glyph == '.');
            }
            previous = next;
        }
    }

    #[test]
    fn rejects_mismatched_frames() {
        let a = FrameBuffer::new(4, 4);
        let b = FrameBuffer::new(4, 5);
        assert!(matches!(
            blend(&a, &b, 0.5),
            Err(CliftError::DimensionMismatch { .. })
        ));
    }
}
