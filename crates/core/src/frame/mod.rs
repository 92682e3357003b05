use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Glyph ramp ordered from empty to dense. Effects that reason about
/// brightness map glyphs onto this ramp.
pub const DENSITY_RAMP: &[char] = &[' ', '.', ':', '-', '=', '+', '*', '#', '%', '@'];

/// Default foreground colour (white in the 256-colour palette).
pub const DEFAULT_FOREGROUND: u8 = 15;

/// Text attribute bitmask carried by every cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attributes(u8);

impl Attributes {
    pub const NONE: Self = Self(0);
    pub const BOLD: Self = Self(1 << 0);
    pub const DIM: Self = Self(1 << 1);
    pub const ITALIC: Self = Self(1 << 2);
    pub const UNDERLINE: Self = Self(1 << 3);
    pub const BLINK: Self = Self(1 << 4);
    pub const REVERSE: Self = Self(1 << 5);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for Attributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Attributes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// One character cell of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub glyph: char,
    /// Index into the 256-colour terminal palette.
    pub fg: u8,
    pub attrs: Attributes,
}

impl Cell {
    pub const BLANK: Self = Self {
        glyph: ' ',
        fg: DEFAULT_FOREGROUND,
        attrs: Attributes::NONE,
    };

    /// Creates a cell with no attributes.
    pub const fn new(glyph: char, fg: u8) -> Self {
        Self {
            glyph,
            fg,
            attrs: Attributes::NONE,
        }
    }

    pub fn with_attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn is_blank(&self) -> bool {
        self.glyph == ' '
    }

    /// Position of the glyph on [`DENSITY_RAMP`], or the middle of the ramp
    /// for glyphs that are not on it.
    pub fn density(&self) -> usize {
        DENSITY_RAMP
            .iter()
            .position(|glyph| *glyph == self.glyph)
            .unwrap_or(DENSITY_RAMP.len() / 2)
    }
}

impl Default for Cell {
    fn default() -> Self {
        Self::BLANK
    }
}

/// Fixed-size grid of cells. Every position always holds a defined cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffer {
    width: usize,
    height: usize,
    cells: Vec<Cell>,
}

impl FrameBuffer {
    /// Allocates a blank frame.
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, Cell::BLANK)
    }

    /// Creates a `width` x `height` frame with every cell set to `cell`.
    pub fn filled(width: usize, height: usize, cell: Cell) -> Self {
        Self {
            width,
            height,
            cells: vec![cell; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn same_dimensions(&self, other: &FrameBuffer) -> bool {
        self.dimensions() == other.dimensions()
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }

    /// Returns the cell at `(x, y)`, or `None` outside the frame.
    pub fn get(&self, x: usize, y: usize) -> Option<&Cell> {
        if x < self.width && y < self.height {
            self.cells.get(y * self.width + x)
        } else {
            None
        }
    }

    /// Writes a cell, ignoring positions outside the frame.
    pub fn set(&mut self, x: usize, y: usize, cell: Cell) {
        if x < self.width && y < self.height {
            self.cells[y * self.width + x] = cell;
        }
    }

    /// Returns row `y`. Panics if `y` is out of range.
    pub fn row(&self, y: usize) -> &[Cell] {
        let start = y * self.width;
        &self.cells[start..start + self.width]
    }

    pub fn row_mut(&mut self, y: usize) -> &mut [Cell] {
        let start = y * self.width;
        &mut self.cells[start..start + self.width]
    }

    pub fn fill(&mut self, cell: Cell) {
        self.cells.fill(cell);
    }

    /// Blanks every cell.
    pub fn clear(&mut self) {
        self.fill(Cell::BLANK);
    }

    /// Re-allocates the grid at a new size. The contents are cleared.
    pub fn resize(&mut self, width: usize, height: usize) {
        self.width = width;
        self.height = height;
        self.cells = vec![Cell::BLANK; width * height];
    }

    /// Writes `text` starting at `(x, y)`, clipped to the frame and to
    /// `max_width` cells. Returns the number of cells written.
    pub fn put_str(
        &mut self,
        x: usize,
        y: usize,
        text: &str,
        max_width: usize,
        fg: u8,
        attrs: Attributes,
    ) -> usize {
        if y >= self.height {
            return 0;
        }

        let mut written = 0;
        for (offset, glyph) in text.chars().enumerate() {
            let column = x + offset;
            if offset >= max_width || column >= self.width {
                break;
            }
            let glyph = if glyph.is_control() { ' ' } else { glyph };
            self.set(column, y, Cell { glyph, fg, attrs });
            written += 1;
        }
        written
    }

    /// Renders the glyphs row by row, mostly useful for tests and logs.
    pub fn to_text(&self) -> String {
        let mut text = String::with_capacity((self.width + 1) * self.height);
        for y in 0..self.height {
            text.extend(self.row(y).iter().map(|cell| cell.glyph));
            text.push('\n');
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_reallocates_and_clears() {
        let mut frame = FrameBuffer::filled(4, 2, Cell::new('#', 1));
        frame.resize(3, 5);

        assert_eq!(frame.dimensions(), (3, 5));
        assert_eq!(frame.cells().len(), 15);
        assert!(frame.cells().iter().all(|cell| *cell == Cell::BLANK));
    }

    #[test]
    fn out_of_bounds_writes_are_ignored() {
        let mut frame = FrameBuffer::new(2, 2);
        frame.set(5, 0, Cell::new('x', 1));
        frame.set(0, 5, Cell::new('x', 1));
        assert!(frame.cells().iter().all(Cell::is_blank));
        assert!(frame.get(2, 0).is_none());
    }

    #[test]
    fn put_str_clips_and_sanitises() {
        let mut frame = FrameBuffer::new(5, 1);
        let written = frame.put_str(2, 0, "a\tbcd", 10, 3, Attributes::BOLD);

        assert_eq!(written, 3);
        assert_eq!(frame.to_text(), "  a b\n");
        assert!(frame.get(2, 0).unwrap().attrs.contains(Attributes::BOLD));
    }

    #[test]
    fn attribute_flags_combine() {
        let mut attrs = Attributes::BOLD | Attributes::DIM;
        assert!(attrs.contains(Attributes::DIM));
        attrs.remove(Attributes::DIM);
        assert!(!attrs.contains(Attributes::DIM));
        assert!(attrs.contains(Attributes::BOLD));
    }
}
