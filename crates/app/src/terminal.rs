use std::{
    io::{self, BufWriter, Stdout, Write},
    time::Duration,
};

use clift_core::{
    command::{Command, CommandSender, Direction},
    deck::DeckId,
    frame::{Attributes, FrameBuffer},
    worker::{StopSignal, Worker},
    Result,
};
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute, queue,
    style::{Attribute, Color, Print, SetAttribute, SetForegroundColor},
    terminal::{self, disable_raw_mode, enable_raw_mode, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
};
use tracing::{debug, info};

use crate::scenes::DEMO_SCENES;

const INPUT_POLL: Duration = Duration::from_millis(50);
const CROSSFADE_STEP: f32 = 0.05;

/// Current terminal size, if it can be queried.
pub fn size() -> Option<(usize, usize)> {
    terminal::size()
        .ok()
        .map(|(columns, rows)| (columns as usize, rows as usize))
}

/// Draws frames on the alternate screen. Restores the terminal on drop.
pub struct TerminalSink {
    out: BufWriter<Stdout>,
    restored: bool,
}

impl TerminalSink {
    pub fn enter() -> Result<Self> {
        enable_raw_mode()?;
        let mut out = BufWriter::new(io::stdout());
        execute!(out, EnterAlternateScreen, Hide, Clear(ClearType::All))?;
        Ok(Self {
            out,
            restored: false,
        })
    }

    pub fn restore(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        execute!(self.out, SetAttribute(Attribute::Reset), Show, LeaveAlternateScreen)?;
        disable_raw_mode()?;
        Ok(())
    }

    /// Emits one row, switching colour and attributes only between runs.
    fn draw_row(&mut self, frame: &FrameBuffer, y: usize) -> io::Result<()> {
        queue!(self.out, MoveTo(0, y as u16), SetAttribute(Attribute::Reset))?;
        let mut style = None;
        let mut run = String::with_capacity(frame.width());

        for cell in frame.row(y) {
            let cell_style = (cell.fg, cell.attrs);
            if style != Some(cell_style) {
                if !run.is_empty() {
                    queue!(self.out, Print(&run))?;
                    run.clear();
                }
                queue!(self.out, SetAttribute(Attribute::Reset))?;
                for attribute in attributes(cell.attrs) {
                    queue!(self.out, SetAttribute(attribute))?;
                }
                queue!(self.out, SetForegroundColor(Color::AnsiValue(cell.fg)))?;
                style = Some(cell_style);
            }
            run.push(cell.glyph);
        }
        if !run.is_empty() {
            queue!(self.out, Print(&run))?;
        }
        Ok(())
    }
}

impl clift_core::scheduler::FrameSink for TerminalSink {
    fn present(&mut self, frame: &FrameBuffer) -> Result<()> {
        for y in 0..frame.height() {
            self.draw_row(frame, y)?;
        }
        self.out.flush()?;
        Ok(())
    }
}

impl Drop for TerminalSink {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

fn attributes(attrs: Attributes) -> impl Iterator<Item = Attribute> {
    [
        (Attributes::BOLD, Attribute::Bold),
        (Attributes::DIM, Attribute::Dim),
        (Attributes::ITALIC, Attribute::Italic),
        (Attributes::UNDERLINE, Attribute::Underlined),
        (Attributes::BLINK, Attribute::SlowBlink),
        (Attributes::REVERSE, Attribute::Reverse),
    ]
    .into_iter()
    .filter(move |(flag, _)| attrs.contains(*flag))
    .map(|(_, attribute)| attribute)
}

/// Reads keys and terminal resizes and turns them into commands. Raises
/// `quit` when the operator asks to leave.
pub fn spawn_input(commands: CommandSender, quit: StopSignal) -> Result<Worker> {
    Worker::spawn("clift-input", move |stop| {
        let mut keys = KeyMap::default();
        while !stop.is_stopped() && !quit.is_stopped() {
            let event = match event::poll(INPUT_POLL) {
                Ok(true) => event::read(),
                Ok(false) => continue,
                Err(error) => Err(error),
            };
            let batch = match event {
                Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => match keys.handle(key) {
                    KeyAction::Quit => {
                        info!("quit requested");
                        quit.stop();
                        break;
                    }
                    KeyAction::Send(batch) => batch,
                    KeyAction::Ignore => continue,
                },
                Ok(Event::Resize(columns, rows)) => vec![Command::Resize {
                    width: columns as usize,
                    height: rows as usize,
                }],
                Ok(_) => continue,
                Err(error) => {
                    debug!(%error, "terminal input failed");
                    quit.stop();
                    break;
                }
            };
            if commands.send_batch(batch).is_err() {
                break;
            }
        }
    })
}

#[derive(Debug, PartialEq)]
enum KeyAction {
    Send(Vec<Command>),
    Quit,
    Ignore,
}

/// Key bindings. Tracks the crossfader position so arrows can step it,
/// and the transport so space can toggle it.
#[derive(Debug, Default)]
struct KeyMap {
    crossfade: f32,
    stopped: bool,
}

impl KeyMap {
    fn handle(&mut self, key: KeyEvent) -> KeyAction {
        let command = match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return KeyAction::Quit,
            KeyCode::Char('q') | KeyCode::Esc => return KeyAction::Quit,
            KeyCode::Left | KeyCode::Down => self.step_crossfade(-CROSSFADE_STEP),
            KeyCode::Right | KeyCode::Up => self.step_crossfade(CROSSFADE_STEP),
            KeyCode::Char('e') => Command::CycleEffect(Direction::Forward),
            KeyCode::Char('E') => Command::CycleEffect(Direction::Backward),
            KeyCode::Char('l') => Command::ToggleClockSource,
            KeyCode::Char('r') => Command::ResetTransport,
            KeyCode::Char(' ') => {
                self.stopped = !self.stopped;
                Command::SetPlaying(!self.stopped)
            }
            KeyCode::Char(digit @ '0'..='9') => {
                // 1-5 pick deck A's scene, 6-9 and 0 deck B's.
                let slot = (digit as usize - '0' as usize + 9) % 10;
                let (deck, index) = if slot < DEMO_SCENES {
                    (DeckId::A, slot)
                } else {
                    (DeckId::B, slot - DEMO_SCENES)
                };
                Command::SelectScene {
                    deck,
                    category: 0,
                    index,
                }
            }
            _ => return KeyAction::Ignore,
        };
        KeyAction::Send(vec![command])
    }

    fn step_crossfade(&mut self, delta: f32) -> Command {
        self.crossfade = (self.crossfade + delta).clamp(0.0, 1.0);
        Command::SetCrossfade(self.crossfade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(keys: &mut KeyMap, code: KeyCode) -> KeyAction {
        keys.handle(KeyEvent::new(code, KeyModifiers::NONE))
    }

    #[test]
    fn digits_select_demo_scenes_per_deck() {
        let mut keys = KeyMap::default();
        assert_eq!(
            press(&mut keys, KeyCode::Char('1')),
            KeyAction::Send(vec![Command::SelectScene {
                deck: DeckId::A,
                category: 0,
                index: 0,
            }])
        );
        assert_eq!(
            press(&mut keys, KeyCode::Char('6')),
            KeyAction::Send(vec![Command::SelectScene {
                deck: DeckId::B,
                category: 0,
                index: 0,
            }])
        );
        assert_eq!(
            press(&mut keys, KeyCode::Char('0')),
            KeyAction::Send(vec![Command::SelectScene {
                deck: DeckId::B,
                category: 0,
                index: 4,
            }])
        );
    }

    #[test]
    fn arrows_step_a_clamped_crossfader() {
        let mut keys = KeyMap::default();
        assert_eq!(
            press(&mut keys, KeyCode::Left),
            KeyAction::Send(vec![Command::SetCrossfade(0.0)])
        );
        for _ in 0..30 {
            press(&mut keys, KeyCode::Right);
        }
        assert_eq!(keys.crossfade, 1.0);
        assert_eq!(press(&mut keys, KeyCode::Esc), KeyAction::Quit);
    }

    #[test]
    fn space_toggles_the_transport() {
        let mut keys = KeyMap::default();
        assert_eq!(
            press(&mut keys, KeyCode::Char(' ')),
            KeyAction::Send(vec![Command::SetPlaying(false)])
        );
        assert_eq!(
            press(&mut keys, KeyCode::Char(' ')),
            KeyAction::Send(vec![Command::SetPlaying(true)])
        );
        assert_eq!(press(&mut keys, KeyCode::Char('z')), KeyAction::Ignore);
    }
}
