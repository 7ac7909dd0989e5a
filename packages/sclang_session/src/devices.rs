//! Parsing the enumeration response into a device table.
//!
//! After `MIDIClient.init;` the interpreter prints one line per MIDI
//! destination. The field layout is an implementation detail of the tool,
//! not a documented protocol, so any deviation from the expected shape is
//! a hard parse error rather than a silently misattributed field.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::token::tokenize;

/// Device lines start with this marker; everything before the first such
/// line (version banners, compile notices) is discarded.
pub const DEVICE_LINE_MARKER: &str = "MIDI Destination";

/// Numeric identifiers needed to address one MIDI destination in commands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub uid: i64,
    pub index: u32,
}

/// Mapping from a destination's human-readable name to its identifiers.
///
/// Replaced wholesale each time an enumeration completes; readers only
/// ever see a finished snapshot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceTable {
    entries: HashMap<String, DeviceEntry>,
}

impl DeviceTable {
    pub fn get(&self, name: &str) -> Option<&DeviceEntry> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DeviceEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum DeviceParseError {
    #[error("device line `{line}` is not a comma-separated clause pair")]
    MissingClause { line: String },

    #[error(
        "device line `{line}`: {clause} clause has {found} tokens, expected {expected}"
    )]
    TokenCount {
        line: String,
        clause: &'static str,
        found: usize,
        expected: usize,
    },

    #[error("device line `{line}`: {field} `{value}` is not numeric")]
    BadNumber {
        line: String,
        field: &'static str,
        value: String,
    },
}

/// Parse one completed enumeration response (prompt echoes already
/// filtered out) into a device table.
///
/// Later lines with a duplicate device name overwrite earlier ones. A
/// response without any marker line yields an empty table: a host with no
/// MIDI destinations is legal, whereas a malformed line after the marker
/// is fatal.
pub fn parse_device_table(lines: &[String]) -> Result<DeviceTable, DeviceParseError> {
    let mut table = DeviceTable::default();
    let mut in_devices = false;

    for line in lines {
        if !in_devices {
            if line.trim_start().starts_with(DEVICE_LINE_MARKER) {
                in_devices = true;
            } else {
                continue;
            }
        }
        let (name, entry) = parse_device_line(line)?;
        table.entries.insert(name, entry);
    }

    Ok(table)
}

/// One device line, e.g. `MIDI Destination 0: 0 'synthport', MIDI uid 42`:
/// the first clause carries the device index (fourth token) and quoted
/// name (fifth token), the second clause carries the uid (third token).
fn parse_device_line(line: &str) -> Result<(String, DeviceEntry), DeviceParseError> {
    let (first, second) = line
        .split_once(',')
        .ok_or_else(|| DeviceParseError::MissingClause { line: line.into() })?;

    let first_tokens = tokenize(first);
    if first_tokens.len() != 5 {
        return Err(DeviceParseError::TokenCount {
            line: line.into(),
            clause: "destination",
            found: first_tokens.len(),
            expected: 5,
        });
    }
    let second_tokens = tokenize(second);
    if second_tokens.len() != 3 {
        return Err(DeviceParseError::TokenCount {
            line: line.into(),
            clause: "uid",
            found: second_tokens.len(),
            expected: 3,
        });
    }

    let index = first_tokens[3]
        .parse()
        .map_err(|_| DeviceParseError::BadNumber {
            line: line.into(),
            field: "device index",
            value: first_tokens[3].into(),
        })?;
    let name = first_tokens[4].trim_matches('\'').to_string();
    let uid = second_tokens[2]
        .parse()
        .map_err(|_| DeviceParseError::BadNumber {
            line: line.into(),
            field: "uid",
            value: second_tokens[2].into(),
        })?;

    Ok((name, DeviceEntry { uid, index }))
}
