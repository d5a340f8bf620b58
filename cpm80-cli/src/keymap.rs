//! Keymap file parsing.
//!
//! A keymap line maps a special key to the byte sequence the guest
//! program expects for it, e.g. `KEY_RIGHT ^KC` sends Ctrl-K then 'C'
//! whenever the right arrow is pressed. `#` starts a comment; `^X`
//! encodes a control character.

use std::collections::HashMap;
use std::path::Path;

use log::warn;

const KNOWN_KEYS: &[&str] = &[
    "KEY_LEFT",
    "KEY_RIGHT",
    "KEY_UP",
    "KEY_DOWN",
    "KEY_NPAGE",
    "KEY_PPAGE",
    "KEY_HOME",
    "KEY_END",
];

#[derive(Default)]
pub struct Keymap {
    map: HashMap<String, Vec<u8>>,
}

impl Keymap {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a keymap file; unknown key names are skipped with a warning.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut map = HashMap::new();

        for line in text.lines() {
            let line = match line.find('#') {
                Some(hash) => &line[..hash],
                None => line,
            };
            let line = line.to_uppercase();
            let mut fields = line.split_whitespace();
            let (Some(name), Some(sequence)) = (fields.next(), fields.next()) else {
                continue;
            };
            if KNOWN_KEYS.contains(&name) {
                map.insert(name.to_string(), parse_sequence(sequence));
            } else {
                warn!("Ignoring unknown key name '{}' in {}", name, path.display());
            }
        }

        Ok(Self { map })
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Option<&[u8]> {
        self.map.get(name).map(Vec::as_slice)
    }
}

/// Convert e.g. `^KD` to Ctrl-K (0x0B) followed by 'D'.
fn parse_sequence(sequence: &str) -> Vec<u8> {
    let mut result = Vec::new();
    let bytes = sequence.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'^' && i + 1 < bytes.len() {
            i += 1;
            result.push(bytes[i].wrapping_sub(b'A').wrapping_add(1));
        } else {
            result.push(bytes[i]);
        }
        i += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("^KD"), vec![0x0B, b'D']);
        assert_eq!(parse_sequence("^A"), vec![0x01]);
        assert_eq!(parse_sequence("AB"), vec![b'A', b'B']);
        assert_eq!(parse_sequence("^"), vec![b'^']);
    }

    #[test]
    fn test_load_keymap() {
        let dir = std::env::temp_dir().join(format!("cpm80-keymap-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.keys");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "# WordStar cursor keys").unwrap();
        writeln!(file, "KEY_RIGHT ^D").unwrap();
        writeln!(file, "KEY_NPAGE ^C").unwrap();
        writeln!(file, "KEY_BOGUS ^Z").unwrap();
        drop(file);

        let keymap = Keymap::load(&path).unwrap();
        assert_eq!(keymap.lookup("KEY_RIGHT"), Some(&[0x04][..]));
        assert_eq!(keymap.lookup("KEY_NPAGE"), Some(&[0x03][..]));
        assert_eq!(keymap.lookup("KEY_BOGUS"), None);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
