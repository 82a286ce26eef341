use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use super::{CallGate, ResolutionStrategy};
use crate::error::SourceError;
use crate::identifier::{self, CandidateIdentifier, HEAD_OFFICE_BRANCH};
use crate::model::{CanonicalRecord, Location, WorkUnit};
use crate::prefix_table::PrefixTable;
use crate::providers::IdentifierSource;

/// Guesses head-office identifiers inside the location's root ranges and
/// looks each one up directly.
///
/// A hit is accepted only when the entity is active and its activity code
/// falls under the requested category.
pub struct SyntheticProbe {
    source: Arc<dyn IdentifierSource>,
    table: Arc<dyn PrefixTable>,
    probes: usize,
    branch: u32,
    rng: Mutex<StdRng>,
}

impl SyntheticProbe {
    pub const NAME: &'static str = "synthetic";

    pub fn new(source: Arc<dyn IdentifierSource>, table: Arc<dyn PrefixTable>, probes: usize) -> Self {
        Self {
            source,
            table,
            probes,
            branch: HEAD_OFFICE_BRANCH,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic candidates, for reproducible runs.
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Checksum-valid candidates for a location; invalid roots are dropped here.
    pub fn candidates(&self, location: &Location) -> Vec<CandidateIdentifier> {
        let ranges = self.table.ranges_for(location);
        if ranges.is_empty() {
            return Vec::new();
        }
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        (0..self.probes)
            .filter_map(|i| {
                let range = ranges[i % ranges.len()];
                let root = rng.gen_range(range.lo..=range.hi);
                match identifier::generate(root, self.branch) {
                    Ok(id) => Some(id),
                    Err(err) => {
                        trace!(root, error = %err, "discarding candidate");
                        None
                    }
                }
            })
            .collect()
    }

    fn accept(&self, unit: &WorkUnit, record: &CanonicalRecord) -> bool {
        record.status.is_active()
            && record
                .cnae_code
                .as_deref()
                .is_some_and(|code| unit.category.is_compatible(code))
    }
}

#[async_trait]
impl ResolutionStrategy for SyntheticProbe {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn attempt(&self, unit: &WorkUnit, gate: &CallGate) -> Result<CanonicalRecord, SourceError> {
        for id in self.candidates(&unit.location) {
            let raw = match gate
                .call(self.source.name(), || self.source.lookup_by_identifier(&id))
                .await
            {
                Ok(raw) => raw,
                Err(SourceError::NotFound) => continue,
                Err(err) => return Err(err),
            };
            match self.source.normalize(&raw) {
                Some(record) if self.accept(unit, &record) => return Ok(record),
                Some(record) => {
                    debug!(
                        key = %unit.key,
                        cnpj = %id,
                        status = record.status.as_str(),
                        cnae = record.cnae_code.as_deref().unwrap_or("-"),
                        "probe hit rejected"
                    );
                }
                None => debug!(key = %unit.key, cnpj = %id, "probe hit not mappable"),
            }
        }
        Err(SourceError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefix_table::StatePrefixTable;
    use crate::rate_limiter::RateLimiter;
    use crate::retry::RetryPolicy;
    use crate::testing::{unit, FakeIdentifierSource, ProbeAnswer};

    fn gate() -> CallGate {
        CallGate::new(Arc::new(RateLimiter::new(50, 50.0)), RetryPolicy::default())
    }

    fn probe(answer: ProbeAnswer, probes: usize) -> (SyntheticProbe, Arc<FakeIdentifierSource>) {
        let source = Arc::new(FakeIdentifierSource::new(answer));
        let table = Arc::new(StatePrefixTable::embedded().unwrap());
        (SyntheticProbe::new(source.clone(), table, probes).with_seed(42), source)
    }

    #[test]
    fn candidates_are_valid_head_offices_in_range() {
        let (p, _) = probe(ProbeAnswer::NotFound, 20);
        let u = unit("3550308", "4711-3/02");
        let table = StatePrefixTable::embedded().unwrap();
        let ranges = table.ranges_for(&u.location);
        let ids = p.candidates(&u.location);
        assert_eq!(ids.len(), 20);
        for id in ids {
            assert!(id.is_head_office());
            assert!(identifier::validate(&id.digits()).is_ok());
            assert!(ranges.iter().any(|r| (r.lo..=r.hi).contains(&id.root())));
        }
    }

    #[test]
    fn seeded_probes_repeat() {
        let u = unit("3550308", "4711-3/02");
        let (a, _) = probe(ProbeAnswer::NotFound, 5);
        let (b, _) = probe(ProbeAnswer::NotFound, 5);
        assert_eq!(a.candidates(&u.location), b.candidates(&u.location));
    }

    #[tokio::test]
    async fn rejects_incompatible_or_inactive_hits() {
        let u = unit("3550308", "4711-3/02");
        let (p, source) = probe(ProbeAnswer::Active("5611201".into()), 3);
        assert_eq!(p.attempt(&u, &gate()).await, Err(SourceError::NotFound));
        assert_eq!(source.calls(), 3);

        let (p, _) = probe(ProbeAnswer::Closed("4711302".into()), 3);
        assert_eq!(p.attempt(&u, &gate()).await, Err(SourceError::NotFound));

        let (p, source) = probe(ProbeAnswer::Active("4711302".into()), 3);
        let rec = p.attempt(&u, &gate()).await.unwrap();
        assert!(rec.status.is_active());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn transient_errors_abort_the_probe() {
        let u = unit("3550308", "4711-3/02");
        let (p, source) = probe(ProbeAnswer::Fail(SourceError::Unavailable("http 502".into())), 3);
        assert!(matches!(p.attempt(&u, &gate()).await, Err(SourceError::Unavailable(_))));
        assert_eq!(source.calls(), 1);
    }
}
