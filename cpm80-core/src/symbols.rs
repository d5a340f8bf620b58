//! Address-to-label symbol table for trace and debug output.
//!
//! Symbols come from `.lab` files (one `LABEL: equ $HEX` per line) or are
//! added directly for emulator-internal data areas. Several labels may
//! share one address; insertion order is preserved within a bucket.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{info, trace};

use crate::error::{CoreError, CoreResult};

#[derive(Default)]
pub struct SymbolTable {
    symbols: BTreeMap<u16, Vec<(String, String)>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a `.lab` file, tagging every symbol with `namespace`.
    /// Lines that don't look like `LABEL: equ $HEX` are skipped.
    pub fn load(&mut self, path: &Path, namespace: &str) -> CoreResult<()> {
        let file = File::open(path).map_err(|source| CoreError::SymbolFile {
            path: path.to_path_buf(),
            source,
        })?;

        for line in BufReader::new(file).lines() {
            let line = line?;
            let Some(colon) = line.find(':') else {
                continue;
            };
            let Some(dollar) = line.rfind('$') else {
                continue;
            };
            if colon >= dollar {
                continue;
            }
            let label = &line[..colon];
            let value = line[dollar + 1..].trim();
            if label.is_empty() || value.is_empty() {
                continue;
            }
            if let Ok(address) = u16::from_str_radix(value, 16) {
                self.add(namespace, address, label);
            }
        }

        Ok(())
    }

    pub fn add(&mut self, namespace: &str, address: u16, label: &str) {
        self.symbols
            .entry(address)
            .or_default()
            .push((namespace.to_string(), label.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Describe an address as `ns:label+OFFSET` using the symbol with the
    /// greatest address not beyond `address`, or `"?"` if there is none.
    pub fn describe(&self, address: u16) -> String {
        match self.symbols.range(..=address).next_back() {
            Some((&base, bucket)) => {
                // Ties break toward the most recently added label.
                let (namespace, label) = bucket.last().expect("bucket is never empty");
                format!("{}:{}+{:04X}", namespace, label, address - base)
            }
            None => "?".to_string(),
        }
    }

    /// Evaluate an address expression of the form `base`, `base+offset` or
    /// `base-offset`, where each term is a known label (case-insensitive)
    /// or a hex literal. Arithmetic wraps at 16 bits.
    pub fn evaluate_address_expression(&self, s: &str) -> Option<u16> {
        let s = s.trim();
        let operator = s.find(|c| c == '+' || c == '-');

        let (base_str, rest) = match operator {
            Some(index) => (&s[..index], Some((s.as_bytes()[index], &s[index + 1..]))),
            None => (s, None),
        };

        let base = self.evaluate_symbol(base_str)?;

        match rest {
            None => Some(base),
            Some((op, offset_str)) => {
                if offset_str.is_empty() {
                    trace!("Can't parse '{}': missing offset", s);
                    return None;
                }
                let offset = self.evaluate_symbol(offset_str)?;
                Some(match op {
                    b'+' => base.wrapping_add(offset),
                    _ => base.wrapping_sub(offset),
                })
            }
        }
    }

    pub fn dump(&self) {
        info!("{} entries in symbol table:", self.len());
        for (address, bucket) in &self.symbols {
            for (namespace, label) in bucket {
                info!("  {:04X} {}:{}", address, namespace, label);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.values().map(Vec::len).sum()
    }

    fn evaluate_symbol(&self, s: &str) -> Option<u16> {
        if !s.chars().all(|c| c.is_ascii_alphanumeric()) || s.is_empty() {
            trace!("Can't parse '{}'", s);
            return None;
        }

        // A known label wins over a hex interpretation.
        for (address, bucket) in &self.symbols {
            if bucket.iter().any(|(_, label)| label.eq_ignore_ascii_case(s)) {
                return Some(*address);
            }
        }

        match u16::from_str_radix(s, 16) {
            Ok(value) => Some(value),
            Err(_) => {
                trace!("Can't parse '{}' as label or hex", s);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SymbolTable {
        let mut table = SymbolTable::new();
        table.add("BDOS", 0xE406, "FBASE");
        table.add("BDOS", 0xE500, "SEARCH");
        table.add("USER", 0x0100, "START");
        table
    }

    #[test]
    fn test_describe_exact_and_offset() {
        let table = sample();
        assert_eq!(table.describe(0xE406), "BDOS:FBASE+0000");
        assert_eq!(table.describe(0xE409), "BDOS:FBASE+0003");
        assert_eq!(table.describe(0xE500), "BDOS:SEARCH+0000");
        assert_eq!(table.describe(0x0150), "USER:START+0050");
    }

    #[test]
    fn test_describe_below_first_symbol() {
        let table = sample();
        assert_eq!(table.describe(0x0050), "?");
        assert_eq!(SymbolTable::new().describe(0x1234), "?");
    }

    #[test]
    fn test_describe_prefers_last_added_on_tie() {
        let mut table = sample();
        table.add("CPM80", 0xE406, "DPHBASE");
        assert_eq!(table.describe(0xE406), "CPM80:DPHBASE+0000");
    }

    #[test]
    fn test_evaluate_bare_label_and_hex() {
        let table = sample();
        assert_eq!(table.evaluate_address_expression("fbase"), Some(0xE406));
        assert_eq!(table.evaluate_address_expression("FBASE"), Some(0xE406));
        assert_eq!(table.evaluate_address_expression("0100"), Some(0x0100));
        assert_eq!(table.evaluate_address_expression("1A"), Some(0x001A));
    }

    #[test]
    fn test_evaluate_with_offset() {
        let table = sample();
        assert_eq!(table.evaluate_address_expression("fbase+17a"), Some(0xE580));
        assert_eq!(table.evaluate_address_expression("FBASE-6"), Some(0xE400));
        // 16-bit wraparound
        assert_eq!(table.evaluate_address_expression("FFFF+2"), Some(0x0001));
    }

    #[test]
    fn test_evaluate_rejects_garbage() {
        let table = sample();
        assert_eq!(table.evaluate_address_expression("no such"), None);
        assert_eq!(table.evaluate_address_expression("fbase+"), None);
        assert_eq!(table.evaluate_address_expression(""), None);
    }

    #[test]
    fn test_load_lab_format() {
        use std::io::Write;

        let dir = std::env::temp_dir().join(format!("cpm80-symtest-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bdos.lab");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "FBASE: equ $E406").unwrap();
        writeln!(file, "not a symbol line").unwrap();
        writeln!(file, "WBOOT: equ $F203").unwrap();
        drop(file);

        let mut table = SymbolTable::new();
        table.load(&path, "BDOS").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.describe(0xF203), "BDOS:WBOOT+0000");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
