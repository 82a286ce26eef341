//! Upsert-by-business-key storage for entities, persons and affiliations.
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::StorageError;
use crate::identifier::CandidateIdentifier;
use crate::model::{cnae_digits, AffiliatedPerson, CanonicalRecord};
use crate::normalization::extract_persons;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PersonRef(pub i64);

/// Narrows [`Storage::count_existing`]; `None` or an empty list matches everything.
#[derive(Debug, Clone, Default)]
pub struct ExistingFilter {
    /// IBGE municipality code.
    pub location: Option<String>,
    /// Two-letter states (UF).
    pub states: Vec<String>,
    /// CNAE digit prefixes; a record matches if any of them does.
    pub category_prefixes: Vec<String>,
}

impl ExistingFilter {
    /// Uppercased states, as stored.
    pub fn state_codes(&self) -> Vec<String> {
        self.states.iter().map(|s| s.trim().to_uppercase()).collect()
    }

    /// Prefixes reduced to digits, blanks dropped.
    pub fn prefix_digits(&self) -> Vec<String> {
        self.category_prefixes
            .iter()
            .map(|p| cnae_digits(p))
            .filter(|p| !p.is_empty())
            .collect()
    }

    pub fn matches(&self, record: &CanonicalRecord) -> bool {
        let address = &record.address;
        let location_ok = self
            .location
            .as_deref()
            .map_or(true, |code| address.municipality_code.as_deref() == Some(code));
        let states = self.state_codes();
        let state_ok = states.is_empty()
            || address
                .state
                .as_deref()
                .is_some_and(|s| states.iter().any(|w| w.eq_ignore_ascii_case(s.trim())));
        let prefixes = self.prefix_digits();
        let category_ok = prefixes.is_empty()
            || record
                .cnae_code
                .as_deref()
                .map(cnae_digits)
                .is_some_and(|c| prefixes.iter().any(|p| c.starts_with(p.as_str())));
        location_ok && state_ok && category_ok
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub entities: usize,
    pub persons: usize,
    pub affiliations: usize,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn upsert_entity(&self, record: &CanonicalRecord) -> Result<EntityRef, StorageError>;
    /// `entity` scopes persons that carry no identity of their own.
    async fn upsert_person(
        &self,
        entity: &CandidateIdentifier,
        person: &AffiliatedPerson,
    ) -> Result<PersonRef, StorageError>;
    async fn record_affiliation(
        &self,
        entity: EntityRef,
        person: PersonRef,
        role: Option<&str>,
        joined_on: Option<NaiveDate>,
    ) -> Result<(), StorageError>;
    async fn count_existing(&self, filter: &ExistingFilter) -> Result<u64, StorageError>;

    /// Writes entities and their extracted persons. Backends that can make
    /// this atomic should override it.
    async fn persist_batch(&self, records: &[CanonicalRecord]) -> Result<BatchReport, StorageError> {
        write_sequential(self, records).await
    }
}

/// Record-by-record persistence through the single-row operations.
pub async fn write_sequential<S: Storage + ?Sized>(
    storage: &S,
    records: &[CanonicalRecord],
) -> Result<BatchReport, StorageError> {
    let mut report = BatchReport::default();
    for record in records {
        let entity = storage.upsert_entity(record).await?;
        report.entities += 1;
        for person in extract_persons(record) {
            let person_ref = storage.upsert_person(&record.identifier, &person).await?;
            report.persons += 1;
            storage
                .record_affiliation(entity, person_ref, person.role.as_deref(), person.joined_on)
                .await?;
            report.affiliations += 1;
        }
    }
    Ok(report)
}
