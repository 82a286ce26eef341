use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use indexmap::IndexMap;

use super::{write_sequential, BatchReport, EntityRef, ExistingFilter, PersonRef, Storage};
use crate::error::StorageError;
use crate::identifier::CandidateIdentifier;
use crate::model::{AffiliatedPerson, CanonicalRecord};
use crate::normalization::person_key;

#[derive(Debug, Default)]
struct Tables {
    entities: IndexMap<CandidateIdentifier, CanonicalRecord>,
    persons: IndexMap<String, AffiliatedPerson>,
    affiliations: IndexMap<(EntityRef, PersonRef, String), Option<NaiveDate>>,
}

/// Process-local backend with the same upsert semantics as Postgres.
/// Backs `--dry-run` and the tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
    reject_batches: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` batches fail without writing anything.
    pub fn reject_next_batches(&self, n: usize) {
        self.reject_batches.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn entity_count(&self) -> usize {
        self.lock().entities.len()
    }

    pub fn person_count(&self) -> usize {
        self.lock().persons.len()
    }

    pub fn entity(&self, id: &CandidateIdentifier) -> Option<CanonicalRecord> {
        self.lock().entities.get(id).cloned()
    }

    /// `(person name, role)` pairs linked to an entity.
    pub fn affiliations_of(&self, id: &CandidateIdentifier) -> Vec<(String, String)> {
        let tables = self.lock();
        let Some(idx) = tables.entities.get_index_of(id) else {
            return Vec::new();
        };
        tables
            .affiliations
            .keys()
            .filter(|(e, _, _)| e.0 == idx as i64)
            .filter_map(|(_, p, role)| {
                tables
                    .persons
                    .get_index(p.0 as usize)
                    .map(|(_, person)| (person.name.clone(), role.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn upsert_entity(&self, record: &CanonicalRecord) -> Result<EntityRef, StorageError> {
        let mut tables = self.lock();
        let (idx, _) = tables.entities.insert_full(record.identifier, record.clone());
        Ok(EntityRef(idx as i64))
    }

    async fn upsert_person(
        &self,
        entity: &CandidateIdentifier,
        person: &AffiliatedPerson,
    ) -> Result<PersonRef, StorageError> {
        let mut tables = self.lock();
        let (idx, _) = tables.persons.insert_full(person_key(person, entity), person.clone());
        Ok(PersonRef(idx as i64))
    }

    async fn record_affiliation(
        &self,
        entity: EntityRef,
        person: PersonRef,
        role: Option<&str>,
        joined_on: Option<NaiveDate>,
    ) -> Result<(), StorageError> {
        let mut tables = self.lock();
        let slot = tables
            .affiliations
            .entry((entity, person, role.unwrap_or_default().to_string()))
            .or_insert(None);
        if joined_on.is_some() {
            *slot = joined_on;
        }
        Ok(())
    }

    async fn count_existing(&self, filter: &ExistingFilter) -> Result<u64, StorageError> {
        let tables = self.lock();
        Ok(tables.entities.values().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn persist_batch(&self, records: &[CanonicalRecord]) -> Result<BatchReport, StorageError> {
        let pending = self.reject_batches.load(Ordering::SeqCst);
        if pending > 0 {
            self.reject_batches.store(pending - 1, Ordering::SeqCst);
            return Err(StorageError::Rejected("injected batch failure".into()));
        }
        write_sequential(self, records).await
    }
}
