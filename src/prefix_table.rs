//! Region-informed root ranges used to synthesize plausible identifiers.
//!
//! The mapping is a heuristic and is meant to be swapped out: anything that
//! implements [`PrefixTable`] can drive the synthetic probe.
use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::model::Location;

const EMBEDDED: &str = include_str!("../data/prefixes.json");

/// Inclusive range of 8-digit CNPJ roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "(u32, u32)")]
pub struct RootRange {
    pub lo: u32,
    pub hi: u32,
}

impl From<(u32, u32)> for RootRange {
    fn from((a, b): (u32, u32)) -> Self {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self {
            lo: lo.min(99_999_999),
            hi: hi.min(99_999_999),
        }
    }
}

pub trait PrefixTable: Send + Sync {
    /// Candidate root ranges for a location, most plausible first. Never empty.
    fn ranges_for(&self, location: &Location) -> Vec<RootRange>;
}

#[derive(Debug, Clone, Deserialize)]
struct TableFile {
    default: Vec<RootRange>,
    #[serde(default)]
    states: HashMap<String, Vec<RootRange>>,
}

/// Per-state ranges with a catch-all default.
#[derive(Debug, Clone)]
pub struct StatePrefixTable {
    default: Vec<RootRange>,
    states: HashMap<String, Vec<RootRange>>,
}

impl StatePrefixTable {
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: TableFile = serde_json::from_str(raw).context("parsing prefix table")?;
        if file.default.is_empty() {
            anyhow::bail!("prefix table needs at least one default range");
        }
        Ok(Self {
            default: file.default,
            states: file
                .states
                .into_iter()
                .map(|(uf, ranges)| (uf.to_ascii_uppercase(), ranges))
                .filter(|(_, ranges)| !ranges.is_empty())
                .collect(),
        })
    }

    /// The coarse table shipped with the crate.
    pub fn embedded() -> Result<Self> {
        Self::from_json(EMBEDDED)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading prefix table {}", path.display()))?;
        Self::from_json(&raw)
    }
}

impl PrefixTable for StatePrefixTable {
    fn ranges_for(&self, location: &Location) -> Vec<RootRange> {
        self.states
            .get(&location.state.to_ascii_uppercase())
            .unwrap_or(&self.default)
            .clone()
    }
}
