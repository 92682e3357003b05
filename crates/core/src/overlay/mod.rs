//! Per-deck overlay text and the status row.
//!
//! Overlay messages arrive as JSON objects
//! `{"player": 0|1, "code": string?, "executed": string?, "active": bool}`.
//! Omitted `code`/`executed` fields leave the current text untouched.

mod server;

use serde::{Deserialize, Serialize};

use crate::{
    deck::DeckId,
    frame::{Attributes, Cell, FrameBuffer},
    CliftError, Result,
};

pub use server::OverlayServer;

const CODE_FOREGROUND: u8 = 229;
const RESULT_FOREGROUND: u8 = 16;
const STATUS_FOREGROUND: u8 = 250;

/// Text shown atop one deck's region. Last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayState {
    pub code_text: String,
    pub result_text: String,
    pub visible: bool,
}

impl OverlayState {
    /// Replaces the fields present in `update`; absent text is kept.
    pub fn apply(&mut self, update: &OverlayUpdate) {
        if let Some(code) = &update.code {
            self.code_text.clone_from(code);
        }
        if let Some(result) = &update.result {
            self.result_text.clone_from(result);
        }
        self.visible = update.visible;
    }
}

/// A parsed overlay message. `None` fields are left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OverlayUpdate {
    pub code: Option<String>,
    pub result: Option<String>,
    pub visible: bool,
}

#[derive(Debug, Deserialize)]
struct OverlayMessage {
    player: u64,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    executed: Option<String>,
    active: bool,
}

/// Parses one overlay message. Unknown fields are ignored; a missing
/// required field, a field of the wrong type or an unknown player is an
/// error.
pub fn parse_overlay_message(text: &str) -> Result<(DeckId, OverlayUpdate)> {
    let message: OverlayMessage = serde_json::from_str(text)?;
    let deck = DeckId::from_player(message.player)
        .ok_or(CliftError::InvalidInput("overlay player out of range"))?;
    Ok((
        deck,
        OverlayUpdate {
            code: message.code,
            result: message.executed,
            visible: message.active,
        },
    ))
}

/// Overlay state of both decks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overlays {
    decks: [OverlayState; 2],
}

impl Overlays {
    /// Creates empty, hidden overlays for both decks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the overlay of `deck`.
    pub fn get(&self, deck: DeckId) -> &OverlayState {
        &self.decks[deck.index()]
    }

    /// Applies a partial update to the overlay of `deck`.
    pub fn apply(&mut self, deck: DeckId, update: &OverlayUpdate) {
        self.decks[deck.index()].apply(update);
    }

    /// Draws each visible overlay into its deck's half of the frame: code
    /// from the top-left corner down, the executed line at the bottom-left.
    /// `reserved_rows` at the bottom of the frame are left alone.
    pub fn draw(&self, frame: &mut FrameBuffer, reserved_rows: usize) {
        let rows = frame.height().saturating_sub(reserved_rows);
        if rows == 0 {
            return;
        }

        for deck in DeckId::ALL {
            let overlay = self.get(deck);
            if !overlay.visible {
                continue;
            }
            let (left, width) = deck_region(frame.width(), deck);
            let text_width = width.saturating_sub(2);
            let column = left + 1;

            let has_result = !overlay.result_text.is_empty();
            let code_rows = if has_result { rows.saturating_sub(1) } else { rows };
            for (y, line) in overlay.code_text.lines().take(code_rows).enumerate() {
                frame.put_str(column, y, line, text_width, CODE_FOREGROUND, Attributes::BOLD);
            }

            if has_result {
                let line = format!("> {}", first_line(&overlay.result_text));
                frame.put_str(
                    column,
                    rows - 1,
                    &line,
                    text_width,
                    RESULT_FOREGROUND,
                    Attributes::REVERSE,
                );
            }
        }
    }
}

/// Left edge and width of a deck's screen region.
pub fn deck_region(frame_width: usize, deck: DeckId) -> (usize, usize) {
    let half = frame_width / 2;
    match deck {
        DeckId::A => (0, half),
        DeckId::B => (half, frame_width - half),
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

/// Passive indicators shown on the bottom row of every frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine<'a> {
    pub clock_label: &'a str,
    pub bpm: f64,
    pub beat: f64,
    pub bar_phase: f64,
    pub playing: bool,
    pub peers: usize,
    pub audio_active: bool,
    pub effect: &'a str,
    pub crossfade: f32,
}

impl StatusLine<'_> {
    /// Formats the indicators as one line of text.
    pub fn render(&self) -> String {
        format!(
            " {} {:6.1} bpm | beat {:8.2} bar {:3.0}% {} | peers {} | audio {} | fx {} | xf {:.2}",
            self.clock_label,
            self.bpm,
            self.beat,
            self.bar_phase * 100.0,
            if self.playing { "play" } else { "stop" },
            self.peers,
            if self.audio_active { "on" } else { "--" },
            self.effect,
            self.crossfade,
        )
    }

    /// Overwrites the last row of `frame`.
    pub fn draw(&self, frame: &mut FrameBuffer) {
        let Some(y) = frame.height().checked_sub(1) else {
            return;
        };
        let width = frame.width();
        frame.row_mut(y).fill(Cell::BLANK.with_attrs(Attributes::REVERSE));
        frame.put_str(0, y, &self.render(), width, STATUS_FOREGROUND, Attributes::REVERSE);
    }
}
