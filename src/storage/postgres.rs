use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use indexmap::IndexMap;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};

use super::{BatchReport, EntityRef, ExistingFilter, PersonRef, Storage};
use crate::error::StorageError;
use crate::identifier::CandidateIdentifier;
use crate::model::{AffiliatedPerson, CanonicalRecord};
use crate::normalization::{extract_persons, person_key};
use crate::util::db::Db;

const ENTITY_UPSERT_TAIL: &str = " ON CONFLICT (cnpj) DO UPDATE SET
      legal_name = EXCLUDED.legal_name,
      trade_name = COALESCE(EXCLUDED.trade_name, business_entities.trade_name),
      status = EXCLUDED.status,
      cnae_code = COALESCE(EXCLUDED.cnae_code, business_entities.cnae_code),
      street = COALESCE(EXCLUDED.street, business_entities.street),
      number = COALESCE(EXCLUDED.number, business_entities.number),
      complement = COALESCE(EXCLUDED.complement, business_entities.complement),
      district = COALESCE(EXCLUDED.district, business_entities.district),
      postal_code = COALESCE(EXCLUDED.postal_code, business_entities.postal_code),
      municipality_code = COALESCE(EXCLUDED.municipality_code, business_entities.municipality_code),
      municipality_name = COALESCE(EXCLUDED.municipality_name, business_entities.municipality_name),
      state = COALESCE(EXCLUDED.state, business_entities.state),
      founded_on = COALESCE(EXCLUDED.founded_on, business_entities.founded_on),
      size = COALESCE(EXCLUDED.size, business_entities.size),
      share_capital = COALESCE(EXCLUDED.share_capital, business_entities.share_capital),
      legal_nature = COALESCE(EXCLUDED.legal_nature, business_entities.legal_nature),
      source = EXCLUDED.source,
      updated_at = now()
    RETURNING id, cnpj";

async fn upsert_entities(
    conn: &mut PgConnection,
    records: &[&CanonicalRecord],
) -> Result<HashMap<String, EntityRef>, StorageError> {
    if records.is_empty() {
        return Ok(HashMap::new());
    }
    let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
        "INSERT INTO business_entities (cnpj, legal_name, trade_name, status, cnae_code, street, number, complement, district, postal_code, municipality_code, municipality_name, state, founded_on, size, share_capital, legal_nature, source) ",
    );
    qb.push_values(records, |mut b, r| {
        b.push_bind(r.identifier.digits())
            .push_bind(&r.legal_name)
            .push_bind(&r.trade_name)
            .push_bind(r.status.as_str())
            .push_bind(&r.cnae_code)
            .push_bind(&r.address.street)
            .push_bind(&r.address.number)
            .push_bind(&r.address.complement)
            .push_bind(&r.address.district)
            .push_bind(&r.address.postal_code)
            .push_bind(&r.address.municipality_code)
            .push_bind(&r.address.municipality_name)
            .push_bind(&r.address.state)
            .push_bind(r.founded_on)
            .push_bind(&r.size)
            .push_bind(r.share_capital)
            .push_bind(&r.legal_nature)
            .push_bind(&r.source);
    });
    qb.push(ENTITY_UPSERT_TAIL);
    let rows = qb.build().persistent(false).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| -> Result<(String, EntityRef), StorageError> {
            Ok((row.try_get("cnpj")?, EntityRef(row.try_get("id")?)))
        })
        .collect()
}

async fn upsert_persons(
    conn: &mut PgConnection,
    persons: &IndexMap<String, &AffiliatedPerson>,
) -> Result<HashMap<String, PersonRef>, StorageError> {
    if persons.is_empty() {
        return Ok(HashMap::new());
    }
    let mut qb: QueryBuilder<'_, Postgres> =
        QueryBuilder::new("INSERT INTO persons (person_key, name, document) ");
    qb.push_values(persons, |mut b, (key, p)| {
        b.push_bind(key.as_str())
            .push_bind(p.name.trim())
            .push_bind(&p.document);
    });
    qb.push(
        " ON CONFLICT (person_key) DO UPDATE SET name = EXCLUDED.name, updated_at = now()
          RETURNING id, person_key",
    );
    let rows = qb.build().persistent(false).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| -> Result<(String, PersonRef), StorageError> {
            Ok((row.try_get("person_key")?, PersonRef(row.try_get("id")?)))
        })
        .collect()
}

async fn upsert_affiliations(
    conn: &mut PgConnection,
    links: &IndexMap<(EntityRef, PersonRef, String), Option<NaiveDate>>,
) -> Result<(), StorageError> {
    if links.is_empty() {
        return Ok(());
    }
    let mut qb: QueryBuilder<'_, Postgres> =
        QueryBuilder::new("INSERT INTO entity_affiliations (entity_id, person_id, role, joined_on) ");
    qb.push_values(links, |mut b, ((entity, person, role), joined_on)| {
        b.push_bind(entity.0)
            .push_bind(person.0)
            .push_bind(role.as_str())
            .push_bind(*joined_on);
    });
    qb.push(
        " ON CONFLICT (entity_id, person_id, role)
          DO UPDATE SET joined_on = COALESCE(EXCLUDED.joined_on, entity_affiliations.joined_on)",
    );
    qb.build().persistent(false).execute(&mut *conn).await?;
    Ok(())
}

fn missing(what: &str, key: &str) -> StorageError {
    StorageError::Rejected(format!("{what} {key} not returned by upsert"))
}

#[async_trait]
impl Storage for Db {
    async fn upsert_entity(&self, record: &CanonicalRecord) -> Result<EntityRef, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let digits = record.identifier.digits();
        upsert_entities(&mut conn, &[record])
            .await?
            .remove(&digits)
            .ok_or_else(|| missing("entity", &digits))
    }

    async fn upsert_person(
        &self,
        entity: &CandidateIdentifier,
        person: &AffiliatedPerson,
    ) -> Result<PersonRef, StorageError> {
        let mut conn = self.pool.acquire().await?;
        let key = person_key(person, entity);
        let one = IndexMap::from([(key.clone(), person)]);
        upsert_persons(&mut conn, &one)
            .await?
            .remove(&key)
            .ok_or_else(|| missing("person", &key))
    }

    async fn record_affiliation(
        &self,
        entity: EntityRef,
        person: PersonRef,
        role: Option<&str>,
        joined_on: Option<NaiveDate>,
    ) -> Result<(), StorageError> {
        let mut conn = self.pool.acquire().await?;
        let one = IndexMap::from([((entity, person, role.unwrap_or_default().to_string()), joined_on)]);
        upsert_affiliations(&mut conn, &one).await
    }

    #[instrument(skip(self))]
    async fn count_existing(&self, filter: &ExistingFilter) -> Result<u64, StorageError> {
        let patterns: Vec<String> = filter.prefix_digits().into_iter().map(|p| format!("{p}%")).collect();
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM business_entities
             WHERE ($1::text IS NULL OR municipality_code = $1)
               AND (cardinality($2::text[]) = 0 OR upper(state) = ANY($2))
               AND (cardinality($3::text[]) = 0 OR regexp_replace(cnae_code, '\\D', '', 'g') LIKE ANY($3))",
        )
        .persistent(false)
        .bind(filter.location.as_deref())
        .bind(filter.state_codes())
        .bind(patterns)
        .fetch_one(&self.pool)
        .await?;
        Ok(n.max(0) as u64)
    }

    /// One transaction per batch: entities, then persons, then the links.
    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn persist_batch(&self, records: &[CanonicalRecord]) -> Result<BatchReport, StorageError> {
        // ON CONFLICT cannot touch the same row twice in one statement.
        let entities: IndexMap<String, &CanonicalRecord> = records
            .iter()
            .map(|r| (r.identifier.digits(), r))
            .collect();
        let extracted: Vec<(String, Vec<(String, AffiliatedPerson)>)> = entities
            .iter()
            .map(|(cnpj, r)| {
                let keyed = extract_persons(r)
                    .into_iter()
                    .map(|p| (person_key(&p, &r.identifier), p))
                    .collect();
                (cnpj.clone(), keyed)
            })
            .collect();
        let mut persons: IndexMap<String, &AffiliatedPerson> = IndexMap::new();
        for (_, list) in &extracted {
            for (key, p) in list {
                persons.insert(key.clone(), p);
            }
        }

        let mut tx = self.pool.begin().await?;
        let entity_refs = upsert_entities(&mut *tx, &entities.values().copied().collect::<Vec<_>>()).await?;
        let person_refs = upsert_persons(&mut *tx, &persons).await?;

        let mut links = IndexMap::new();
        for (cnpj, list) in &extracted {
            let entity = *entity_refs.get(cnpj).ok_or_else(|| missing("entity", cnpj))?;
            for (key, p) in list {
                let person = *person_refs.get(key).ok_or_else(|| missing("person", key))?;
                let slot = links
                    .entry((entity, person, p.role.clone().unwrap_or_default()))
                    .or_insert(None);
                if p.joined_on.is_some() {
                    *slot = p.joined_on;
                }
            }
        }
        upsert_affiliations(&mut *tx, &links).await?;
        tx.commit().await?;

        let report = BatchReport {
            entities: entity_refs.len(),
            persons: person_refs.len(),
            affiliations: links.len(),
        };
        debug!(?report, "batch committed");
        Ok(report)
    }
}
