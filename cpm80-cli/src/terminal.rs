//! Host terminal adapters.
//!
//! All three adapters poll crossterm for keystrokes and write guest
//! output to stdout. `plain` passes printable output straight through,
//! `vt100` additionally passes escape sequences unmodified (the host
//! terminal speaks ANSI anyway), and `televideo` translates the common
//! Televideo 912/920 control codes into their ANSI equivalents.

use std::collections::VecDeque;
use std::io::Write;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};

use cpm80_core::terminal::Terminal;

use crate::keymap::Keymap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TerminalKind {
    Plain,
    Vt100,
    Televideo,
}

/// Cursor-addressing state for the Televideo translation.
enum EscState {
    Idle,
    SawEsc,
    SawAddress,
    SawRow(u8),
}

pub struct HostTerminal {
    kind: TerminalKind,
    keymap: Keymap,
    /// Keymap expansions not yet handed to the guest.
    pending: VecDeque<u8>,
    esc_state: EscState,
}

impl HostTerminal {
    pub fn new(kind: TerminalKind, keymap: Keymap, _columns: u16, _rows: u16) -> Self {
        Self {
            kind,
            keymap,
            pending: VecDeque::new(),
            esc_state: EscState::Idle,
        }
    }

    fn emit(&self, bytes: &[u8]) {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        let _ = handle.write_all(bytes);
        let _ = handle.flush();
    }

    fn print_plain(&mut self, ch: u8) {
        match ch {
            0x0D => self.emit(b"\r"),
            0x0A => self.emit(b"\n"),
            0x08 => self.emit(b"\x08 \x08"),
            0x07 => self.emit(b"\x07"),
            _ => self.emit(&[ch]),
        }
    }

    fn print_televideo(&mut self, ch: u8) {
        // Cursor addressing arrives as ESC '=' row+32 col+32.
        match self.esc_state {
            EscState::SawEsc => {
                self.esc_state = if ch == b'=' {
                    EscState::SawAddress
                } else {
                    EscState::Idle
                };
                return;
            }
            EscState::SawAddress => {
                self.esc_state = EscState::SawRow(ch);
                return;
            }
            EscState::SawRow(row) => {
                let row = row.saturating_sub(31);
                let column = ch.saturating_sub(31);
                self.emit(format!("\x1b[{};{}H", row, column).as_bytes());
                self.esc_state = EscState::Idle;
                return;
            }
            EscState::Idle => {}
        }

        match ch {
            0x1B => self.esc_state = EscState::SawEsc,
            0x1A => self.emit(b"\x1b[2J\x1b[H"), // clear screen
            0x1E => self.emit(b"\x1b[H"),        // cursor home
            0x0B => self.emit(b"\x1b[A"),        // cursor up
            _ => self.print_plain(ch),
        }
    }

    /// Blocking read of one keystroke, keymap expansion included.
    fn read_key(&mut self) -> u8 {
        if let Some(byte) = self.pending.pop_front() {
            return byte;
        }
        loop {
            let Ok(event) = event::read() else {
                return 0;
            };
            let Event::Key(key) = event else {
                continue;
            };
            if key.kind == KeyEventKind::Release {
                continue;
            }

            if let Some(name) = key_name(key.code) {
                if let Some(sequence) = self.keymap.lookup(name) {
                    self.pending.extend(sequence.iter().copied());
                    if let Some(byte) = self.pending.pop_front() {
                        return byte;
                    }
                    continue;
                }
            }
            if let Some(byte) = key_to_byte(key.code, key.modifiers) {
                return byte;
            }
        }
    }
}

impl Terminal for HostTerminal {
    fn print(&mut self, ch: u8) {
        match self.kind {
            TerminalKind::Televideo => self.print_televideo(ch),
            // The host terminal understands ANSI, so VT100 output can
            // pass straight through.
            TerminalKind::Plain | TerminalKind::Vt100 => self.print_plain(ch),
        }
    }

    fn is_character_ready(&mut self) -> bool {
        !self.pending.is_empty() || event::poll(Duration::from_millis(0)).unwrap_or(false)
    }

    fn get_char(&mut self) -> u8 {
        self.read_key()
    }

    fn get_translated_char(&mut self) -> u8 {
        self.read_key()
    }
}

/// The keymap name for a special key, if it has one.
fn key_name(code: KeyCode) -> Option<&'static str> {
    match code {
        KeyCode::Left => Some("KEY_LEFT"),
        KeyCode::Right => Some("KEY_RIGHT"),
        KeyCode::Up => Some("KEY_UP"),
        KeyCode::Down => Some("KEY_DOWN"),
        KeyCode::PageDown => Some("KEY_NPAGE"),
        KeyCode::PageUp => Some("KEY_PPAGE"),
        KeyCode::Home => Some("KEY_HOME"),
        KeyCode::End => Some("KEY_END"),
        _ => None,
    }
}

/// Default key-to-byte translation where no keymap entry applies.
fn key_to_byte(code: KeyCode, modifiers: KeyModifiers) -> Option<u8> {
    if modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char(c) = code {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() {
                return Some(upper as u8 - 64); // Ctrl+A = 1, etc.
            }
        }
    }

    match code {
        KeyCode::Char(c) if c.is_ascii() => Some(c as u8),
        KeyCode::Enter => Some(13),
        KeyCode::Backspace => Some(8),
        KeyCode::Tab => Some(9),
        KeyCode::Esc => Some(27),
        KeyCode::Up => Some(11),
        KeyCode::Down => Some(10),
        KeyCode::Left => Some(8),
        KeyCode::Right => Some(12),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_to_byte_control_characters() {
        assert_eq!(
            key_to_byte(KeyCode::Char('c'), KeyModifiers::CONTROL),
            Some(3)
        );
        assert_eq!(
            key_to_byte(KeyCode::Char('A'), KeyModifiers::CONTROL),
            Some(1)
        );
    }

    #[test]
    fn test_key_to_byte_plain_keys() {
        assert_eq!(key_to_byte(KeyCode::Char('x'), KeyModifiers::NONE), Some(b'x'));
        assert_eq!(key_to_byte(KeyCode::Enter, KeyModifiers::NONE), Some(13));
        assert_eq!(key_to_byte(KeyCode::Left, KeyModifiers::NONE), Some(8));
        assert_eq!(key_to_byte(KeyCode::F(1), KeyModifiers::NONE), None);
    }

    #[test]
    fn test_key_names() {
        assert_eq!(key_name(KeyCode::Right), Some("KEY_RIGHT"));
        assert_eq!(key_name(KeyCode::PageUp), Some("KEY_PPAGE"));
        assert_eq!(key_name(KeyCode::Char('a')), None);
    }
}
