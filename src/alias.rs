//! Human-readable labels for PMU serial numbers.
//!
//! The alias file is a plain `serial = label` list, read once at startup:
//!
//! ```text
//! # substation feeders
//! P3001082 = grizzly-peak
//! P3001097 = soda-hall
//! ```
//!
//! Labels are only used for log output, so a bad line never stops the server.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

/// Label reported for serial numbers missing from the table.
pub const UNKNOWN_LABEL: &str = "UNKNOWN";

#[derive(Debug, Error)]
pub enum AliasError {
    #[error("could not read alias file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Immutable `serial number -> label` map.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    labels: HashMap<String, String>,
}

impl AliasTable {
    /// Parse alias entries from text. Malformed lines are skipped with a warning.
    pub fn parse(text: &str) -> Self {
        let mut labels = HashMap::new();
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((serial, label)) = trimmed.split_once('=') else {
                warn!("Alias line {} has no '=', skipping: {trimmed}", idx + 1);
                continue;
            };
            let serial = serial.trim();
            if serial.is_empty() {
                warn!("Alias line {} has an empty serial number, skipping", idx + 1);
                continue;
            }
            labels.insert(serial.to_string(), label.trim().to_string());
        }
        Self { labels }
    }

    /// Read and parse an alias file.
    pub fn load(path: &Path) -> Result<Self, AliasError> {
        let text = std::fs::read_to_string(path).map_err(|source| AliasError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::parse(&text);
        info!("Loaded {} aliases from {}", table.len(), path.display());
        Ok(table)
    }

    /// Label for `serial`, or [`UNKNOWN_LABEL`].
    pub fn label<'a>(&'a self, serial: &str) -> &'a str {
        self.labels.get(serial).map_or(UNKNOWN_LABEL, String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_whitespace() {
        let t = AliasTable::parse("  P3001082 =  grizzly peak  \nP3001097=soda\n");
        assert_eq!(t.len(), 2);
        assert_eq!(t.label("P3001082"), "grizzly peak");
        assert_eq!(t.label("P3001097"), "soda");
    }

    #[test]
    fn test_unknown_serial() {
        let t = AliasTable::parse("P1 = one");
        assert_eq!(t.label("P2"), UNKNOWN_LABEL);
        assert_eq!(AliasTable::default().label("P1"), UNKNOWN_LABEL);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let t = AliasTable::parse("# header\n\nnot an alias\n = nolabel\nP1 = one\n");
        assert_eq!(t.len(), 1);
        assert_eq!(t.label("P1"), "one");
    }

    #[test]
    fn test_value_may_contain_equals() {
        let t = AliasTable::parse("P1 = a=b");
        assert_eq!(t.label("P1"), "a=b");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aliases.conf");
        std::fs::write(&path, "P5 = five\n").unwrap();
        let t = AliasTable::load(&path).unwrap();
        assert_eq!(t.label("P5"), "five");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = AliasTable::load(&dir.path().join("missing.conf")).unwrap_err();
        assert!(err.to_string().contains("missing.conf"));
    }
}
