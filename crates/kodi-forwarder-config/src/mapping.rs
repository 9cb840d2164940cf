//! Button-mapping documents
//!
//! A mapping document is a JSON file that pairs a controller's raw key names
//! with the actions to perform on the media-center host:
//!
//! ```json
//! {
//!     "name": "rii-mini",
//!     "mapping": {
//!         "KEY_UP": [ { "key": "up" } ],
//!         "KEY_UP_2": [ { "key": "bigstepforward", "flags": 2 } ],
//!         "KEY_POWER": [ { "command": "poweroff", "phase": "release" } ],
//!         "KEY_HOMEPAGE": [ { "action": "ActivateWindow(Home)", "phase": "release" } ]
//!     }
//! }
//! ```
//!
//! Entries are normalized on load: a missing `flags` means "no modifiers
//! held" (0) and a missing `phase` means `press`. Within one key the
//! (flags, phase) pair must be unique so lookups stay deterministic.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::MappingError;

/// Bitset of currently-held modifier keys.
///
/// The bit assignment is part of the mapping file format, so it is fixed:
/// mapping authors write `"flags": 2` to mean "left shift held".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModifierFlags(pub u8);

impl ModifierFlags {
    pub const NONE: Self = Self(0);
    pub const LEFT_CTRL: Self = Self(0x01);
    pub const LEFT_SHIFT: Self = Self(0x02);
    pub const RIGHT_SHIFT: Self = Self(0x04);
    pub const LEFT_ALT: Self = Self(0x08);
    pub const RIGHT_ALT: Self = Self(0x10);
    pub const RIGHT_CTRL: Self = Self(0x20);
    pub const LEFT_META: Self = Self(0x40);
    pub const RIGHT_META: Self = Self(0x80);

    /// The flag contribution of a raw key name. Non-modifier keys
    /// contribute nothing.
    pub fn for_key(name: &str) -> Self {
        match name {
            "KEY_LEFTCTRL" => Self::LEFT_CTRL,
            "KEY_LEFTSHIFT" => Self::LEFT_SHIFT,
            "KEY_RIGHTSHIFT" => Self::RIGHT_SHIFT,
            "KEY_LEFTALT" => Self::LEFT_ALT,
            "KEY_RIGHTALT" => Self::RIGHT_ALT,
            "KEY_RIGHTCTRL" => Self::RIGHT_CTRL,
            "KEY_LEFTMETA" => Self::LEFT_META,
            "KEY_RIGHTMETA" => Self::RIGHT_META,
            _ => Self::NONE,
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl std::ops::BitOr for ModifierFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for ModifierFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// The phase of a key event, as reported by the input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPhase {
    #[default]
    Press,
    Hold,
    Release,
}

impl EventPhase {
    /// Map a raw event value (0/1/2 = release/press/hold) to a phase.
    pub fn from_event_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Release),
            1 => Some(Self::Press),
            2 => Some(Self::Hold),
            _ => None,
        }
    }
}

impl fmt::Display for EventPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Press => write!(f, "press"),
            Self::Hold => write!(f, "hold"),
            Self::Release => write!(f, "release"),
        }
    }
}

/// What a matched entry does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Forward a named button to the host's event server
    #[serde(rename = "key")]
    ForwardKey(String),
    /// Trigger a named power command (handled locally, never forwarded)
    #[serde(rename = "command")]
    SpecialCommand(String),
    /// Send a raw action string to the host's event server
    #[serde(rename = "action")]
    CustomAction(String),
}

/// One normalized mapping entry for a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    #[serde(default)]
    pub flags: ModifierFlags,
    #[serde(default)]
    pub phase: EventPhase,
    #[serde(flatten)]
    pub action: Action,
}

/// Immutable lookup table built once at startup.
#[derive(Debug, Clone)]
pub struct MappingTable {
    name: String,
    entries: HashMap<String, Vec<MappingEntry>>,
}

impl MappingTable {
    /// Name of the mapping document this table was built from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up the entry for `(key, flags, phase)`.
    ///
    /// Entries within a key keep their document order, and the
    /// (flags, phase) pair is validated unique at load time, so the first
    /// match is the only match.
    pub fn lookup(
        &self,
        key: &str,
        flags: ModifierFlags,
        phase: EventPhase,
    ) -> Option<&MappingEntry> {
        self.entries
            .get(key)?
            .iter()
            .find(|e| e.flags == flags && e.phase == phase)
    }

    /// Number of keys with at least one entry.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn from_document(doc: MappingDocument) -> Result<Self, MappingError> {
        let mut entries: HashMap<String, Vec<MappingEntry>> = HashMap::new();

        for (key, key_entries) in doc.mapping {
            let key = key.to_uppercase();
            let mut seen: HashSet<(ModifierFlags, EventPhase)> = HashSet::new();

            for entry in &key_entries {
                if !seen.insert((entry.flags, entry.phase)) {
                    return Err(MappingError::DuplicateEntry {
                        name: doc.name,
                        key,
                        flags: entry.flags.bits(),
                        phase: entry.phase.to_string(),
                    });
                }
                if let Action::ForwardKey(button) = &entry.action {
                    if button.is_empty() {
                        return Err(MappingError::EmptyEntry {
                            name: doc.name,
                            key,
                        });
                    }
                }
            }

            entries.insert(key, key_entries);
        }

        Ok(Self {
            name: doc.name,
            entries,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MappingDocument {
    name: String,
    mapping: HashMap<String, Vec<MappingEntry>>,
}

/// Load the mapping named `name` from the documents under `dir`.
///
/// Every file in the directory is inspected for a top-level `"name"` field.
/// Files that are not valid JSON are skipped with a warning (the directory
/// may hold unrelated files); a selected document that fails to deserialize
/// or validate is a fatal error, as is not finding the name at all.
pub fn load_mapping(dir: &Path, name: &str) -> Result<MappingTable, MappingError> {
    for dir_entry in std::fs::read_dir(dir)? {
        let path = dir_entry?.path();
        if !path.is_file() {
            continue;
        }

        let content = std::fs::read_to_string(&path)?;
        let value: serde_json::Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Skipping {}: not valid JSON: {}", path.display(), e);
                continue;
            }
        };

        if value.get("name").and_then(|n| n.as_str()) != Some(name) {
            continue;
        }

        let doc: MappingDocument =
            serde_json::from_value(value).map_err(|source| MappingError::Malformed {
                name: name.to_string(),
                path: path.clone(),
                source,
            })?;

        let table = MappingTable::from_document(doc)?;
        tracing::info!(
            "Loaded mapping '{}' from {} ({} key(s))",
            name,
            path.display(),
            table.len()
        );
        return Ok(table);
    }

    Err(MappingError::NotFound {
        name: name.to_string(),
        dir: dir.to_path_buf(),
    })
}
