use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::identifier::CandidateIdentifier;

/// A municipality from the reference set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// IBGE municipality code (7 digits).
    pub code: String,
    pub name: String,
    /// Two-letter state (UF).
    pub state: String,
    /// Relative economic weight; heavier municipalities are enumerated first.
    #[serde(default)]
    pub weight: f64,
}

/// A CNAE activity classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub code: String,
    #[serde(default)]
    pub description: String,
}

impl Category {
    /// The code with punctuation removed (`4711-3/02` -> `4711302`).
    pub fn digits(&self) -> String {
        cnae_digits(&self.code)
    }

    /// Whether a record's activity code falls under this category.
    pub fn is_compatible(&self, cnae_code: &str) -> bool {
        let wanted = self.digits();
        !wanted.is_empty() && cnae_digits(cnae_code).starts_with(&wanted)
    }
}

pub fn cnae_digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// One unit of enumeration work: (municipality code, CNAE code).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    pub location: String,
    pub category: String,
}

impl Key {
    pub fn new(location: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            category: category.into(),
        }
    }

    pub fn of(location: &Location, category: &Category) -> Self {
        Self::new(location.code.clone(), category.code.clone())
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.location, self.category)
    }
}

/// A key together with the reference entries it was built from.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub key: Key,
    pub location: Arc<Location>,
    pub category: Arc<Category>,
}

impl WorkUnit {
    pub fn new(location: Arc<Location>, category: Arc<Category>) -> Self {
        Self {
            key: Key::of(&location, &category),
            location,
            category,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Suspended,
    Unfit,
    Closed,
    Null,
    #[default]
    Unknown,
}

impl EntityStatus {
    /// Maps the registry's textual or numeric situation onto a status.
    pub fn parse(raw: &str) -> Self {
        let t = raw.trim().to_ascii_uppercase();
        match t.as_str() {
            "02" | "2" | "ATIVA" | "ATIVO" | "ACTIVE" => Self::Active,
            "03" | "3" | "SUSPENSA" | "SUSPENDED" => Self::Suspended,
            "04" | "4" | "INAPTA" | "UNFIT" => Self::Unfit,
            "08" | "8" | "BAIXADA" | "CLOSED" => Self::Closed,
            "01" | "1" | "NULA" | "NULL" => Self::Null,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Unfit => "unfit",
            Self::Closed => "closed",
            Self::Null => "null",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub street: Option<String>,
    pub number: Option<String>,
    pub complement: Option<String>,
    pub district: Option<String>,
    pub postal_code: Option<String>,
    pub municipality_code: Option<String>,
    pub municipality_name: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffiliatedPerson {
    pub name: String,
    pub role: Option<String>,
    pub joined_on: Option<NaiveDate>,
    /// Masked document as published by the registry (e.g. `***123456**`).
    pub document: Option<String>,
}

/// Source-agnostic view of a resolved business entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub identifier: CandidateIdentifier,
    pub legal_name: String,
    pub trade_name: Option<String>,
    pub status: EntityStatus,
    pub cnae_code: Option<String>,
    pub address: Address,
    pub founded_on: Option<NaiveDate>,
    pub size: Option<String>,
    pub share_capital: Option<f64>,
    pub legal_nature: Option<String>,
    pub persons: Vec<AffiliatedPerson>,
    /// Name of the source that produced the record.
    pub source: String,
}

impl CanonicalRecord {
    /// A record with only the mandatory fields populated.
    pub fn new(
        identifier: CandidateIdentifier,
        legal_name: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            identifier,
            legal_name: legal_name.into(),
            trade_name: None,
            status: EntityStatus::Unknown,
            cnae_code: None,
            address: Address::default(),
            founded_on: None,
            size: None,
            share_capital: None,
            legal_nature: None,
            persons: Vec::new(),
            source: source.into(),
        }
    }
}

/// A resolved record tagged with the key it was produced for.
#[derive(Debug, Clone)]
pub struct ResolvedRecord {
    pub key: Key,
    pub record: CanonicalRecord,
}

/// Aggregate run counters; monotonically non-decreasing within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub attempted: u64,
    pub found: u64,
    pub saved: u64,
    pub not_found: u64,
    pub errors: u64,
    #[serde(default)]
    pub failed_batches: u64,
}

impl Counters {
    pub fn hit_rate(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.found as f64 / self.attempted as f64
        }
    }
}
