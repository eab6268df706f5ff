//! Affinity type catalog
//!
//! The ordered list of named CPU masks loaded from `AffinityTypes.txt`. Index 0 is the
//! default type and index 1 always exists, so "first non-default type" is never dangling.

use crate::config::{DEFAULT_TYPE_NAME, FALLBACK_TYPE_NAME};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Index of the default ("Normal") type.
pub const DEFAULT_TYPE: usize = 0;
/// Index used when a saved type name does not resolve, and for newly added programs.
pub const FALLBACK_TYPE: usize = 1;

const DEFAULT_TYPE_MASK: u64 = 0x1;
const FALLBACK_TYPE_MASK: u64 = !0x1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityType {
    pub name: String,
    pub mask: u64,
}

impl AffinityType {
    pub fn new(name: impl Into<String>, mask: u64) -> Self {
        Self {
            name: name.into(),
            mask,
        }
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read affinity types from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Unknown affinity type: {name}")]
    UnknownType { name: String },
}

/// Immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityCatalog {
    types: Vec<AffinityType>,
}

impl AffinityCatalog {
    /// Parses `name:hexmask` lines.
    ///
    /// Blank lines, `#` comments and lines without a `:` are skipped. Leading whitespace
    /// is dropped but the name is otherwise kept verbatim up to the `:`, so saved names
    /// must match it exactly. A mask that does not parse as hex means every CPU.
    pub fn parse(text: &str) -> Self {
        let mut types: Vec<AffinityType> = text
            .lines()
            .map(str::trim_start)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let (name, mask) = line.split_once(':')?;
                Some(AffinityType::new(name, parse_hex_mask(mask)))
            })
            .collect();

        if types.is_empty() {
            types.push(AffinityType::new(DEFAULT_TYPE_NAME, DEFAULT_TYPE_MASK));
        }
        if types.len() == 1 {
            types.push(AffinityType::new(FALLBACK_TYPE_NAME, FALLBACK_TYPE_MASK));
        }
        Self { types }
    }

    /// Reads the type file. A missing file yields the synthesized defaults.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no affinity type file, using defaults");
                String::new()
            }
            Err(source) => {
                return Err(CatalogError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let catalog = Self::parse(&text);
        debug!(types = catalog.len(), "affinity types loaded");
        Ok(catalog)
    }

    pub fn lookup(&self, index: usize) -> Option<&AffinityType> {
        self.types.get(index)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Never true; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &AffinityType)> {
        self.types.iter().enumerate()
    }

    /// Exact, case-sensitive name match.
    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.types.iter().position(|ty| ty.name == name)
    }

    /// Resolves a saved type name, falling back to [`FALLBACK_TYPE`].
    pub fn resolve_saved_name(&self, name: &str) -> usize {
        self.find_by_name(name).unwrap_or(FALLBACK_TYPE)
    }

    /// Resolves user input naming a type, either by name or by index.
    pub fn resolve_argument(&self, argument: &str) -> Result<usize, CatalogError> {
        if let Some(index) = self.find_by_name(argument) {
            return Ok(index);
        }
        if let Some(index) = self
            .types
            .iter()
            .position(|ty| ty.name.eq_ignore_ascii_case(argument))
        {
            return Ok(index);
        }
        match argument.parse::<usize>() {
            Ok(index) if index < self.types.len() => Ok(index),
            _ => Err(CatalogError::UnknownType {
                name: argument.to_string(),
            }),
        }
    }

    pub fn mask_of(&self, index: usize) -> Option<u64> {
        self.lookup(index).map(|ty| ty.mask)
    }

    pub fn name_of(&self, index: usize) -> &str {
        self.lookup(index)
            .map(|ty| ty.name.as_str())
            .unwrap_or(DEFAULT_TYPE_NAME)
    }
}

/// Leading hex digits with an optional `0x`; anything unreadable is every CPU.
fn parse_hex_mask(text: &str) -> u64 {
    let text = text.trim_start();
    let text = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    let digits: String = text.chars().take_while(char::is_ascii_hexdigit).collect();
    if digits.is_empty() {
        return u64::MAX;
    }
    u64::from_str_radix(&digits, 16).unwrap_or(u64::MAX)
}
