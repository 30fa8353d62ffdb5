//! Keyboard-to-PTY byte encoding.
//!
//! The windowing layer reports named keys (with modifiers) and translated
//! character input separately; both end up as bytes on the PTY master.

use crate::events::Modifiers;

/// Named keys delivered by the window system's key callback. Translated
/// text arrives separately as character input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Enter,
    Backspace,
    Tab,
    Escape,
    Up,
    Down,
    Right,
    Left,
    /// A key with a character meaning; only emits bytes here when Control
    /// is held (plain text goes through char input instead).
    Char(char),
}

/// Encodes a key press. `lnm` makes Enter also send a line feed. Returns
/// an empty vector for keys that produce no bytes on this path.
pub fn encode_key(key: Key, mods: Modifiers, lnm: bool) -> Vec<u8> {
    match key {
        Key::Enter => {
            if lnm {
                b"\r\n".to_vec()
            } else {
                b"\r".to_vec()
            }
        }
        Key::Backspace => b"\x08".to_vec(),
        Key::Tab => b"\t".to_vec(),
        Key::Escape => b"\x1b".to_vec(),
        Key::Up => b"\x1b[A".to_vec(),
        Key::Down => b"\x1b[B".to_vec(),
        Key::Right => b"\x1b[C".to_vec(),
        Key::Left => b"\x1b[D".to_vec(),
        Key::Char(c) => {
            if mods.contains(Modifiers::CONTROL) && c.is_ascii_alphabetic() {
                vec![c.to_ascii_uppercase() as u8 - b'A' + 1]
            } else {
                Vec::new()
            }
        }
    }
}

/// Encodes translated character input as UTF-8.
pub fn encode_char(codepoint: char) -> Vec<u8> {
    let mut buf = [0u8; 4];
    codepoint.encode_utf8(&mut buf).as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_respects_lnm() {
        assert_eq!(encode_key(Key::Enter, Modifiers::empty(), false), b"\r");
        assert_eq!(encode_key(Key::Enter, Modifiers::empty(), true), b"\r\n");
    }

    #[test]
    fn arrows_emit_csi() {
        assert_eq!(encode_key(Key::Up, Modifiers::empty(), false), b"\x1b[A");
        assert_eq!(encode_key(Key::Down, Modifiers::empty(), false), b"\x1b[B");
        assert_eq!(encode_key(Key::Right, Modifiers::empty(), false), b"\x1b[C");
        assert_eq!(encode_key(Key::Left, Modifiers::empty(), false), b"\x1b[D");
    }

    #[test]
    fn control_letters_map_to_c0() {
        assert_eq!(
            encode_key(Key::Char('c'), Modifiers::CONTROL, false),
            vec![0x03]
        );
        assert_eq!(
            encode_key(Key::Char('Z'), Modifiers::CONTROL, false),
            vec![0x1a]
        );
        // Without control, the char callback owns the key.
        assert!(encode_key(Key::Char('c'), Modifiers::empty(), false).is_empty());
    }

    #[test]
    fn char_input_is_utf8() {
        assert_eq!(encode_char('a'), b"a");
        assert_eq!(encode_char('é'), "é".as_bytes());
        assert_eq!(encode_char('中'), "中".as_bytes());
    }
}
