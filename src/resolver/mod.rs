//! Multi-source resolution with ordered fallback.
//!
//! A [`Resolver`] walks its strategies in order and returns the first
//! normalized record. Not-found and transient failures both fall through to
//! the next strategy; they only differ in how the final outcome is counted.
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::HarvestConfig;
use crate::error::SourceError;
use crate::model::{CanonicalRecord, WorkUnit};
use crate::prefix_table::{PrefixTable, StatePrefixTable};
use crate::providers::{DirectoryProvider, OpenDataProvider, RegistryProvider};
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;

pub mod filter;
pub mod synthetic;

pub use filter::FilterStrategy;
pub use synthetic::SyntheticProbe;

/// Every outbound call goes through here: one token per attempt, and the
/// shared retry policy for throttling.
#[derive(Debug, Clone)]
pub struct CallGate {
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl CallGate {
    pub fn new(limiter: Arc<RateLimiter>, retry: RetryPolicy) -> Self {
        Self { limiter, retry }
    }

    pub async fn call<T, F, Fut>(&self, source: &str, op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        self.retry.run(&self.limiter, source, op).await
    }
}

#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn attempt(&self, unit: &WorkUnit, gate: &CallGate) -> Result<CanonicalRecord, SourceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Found {
        record: CanonicalRecord,
        strategy: &'static str,
    },
    /// Every strategy affirmatively reported no match.
    NotFound,
    /// Nothing was found and at least one strategy failed transiently.
    Failed {
        errors: Vec<(&'static str, SourceError)>,
    },
}

pub struct Resolver {
    strategies: Vec<Box<dyn ResolutionStrategy>>,
    gate: CallGate,
}

impl Resolver {
    pub fn new(gate: CallGate) -> Self {
        Self {
            strategies: Vec::new(),
            gate,
        }
    }

    pub fn with_strategy(mut self, strategy: impl ResolutionStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub async fn resolve_detailed(&self, unit: &WorkUnit) -> Resolution {
        let mut errors = Vec::new();
        for strategy in &self.strategies {
            match strategy.attempt(unit, &self.gate).await {
                Ok(record) => {
                    debug!(key = %unit.key, strategy = strategy.name(), cnpj = %record.identifier, "resolved");
                    return Resolution::Found {
                        record,
                        strategy: strategy.name(),
                    };
                }
                Err(SourceError::NotFound) => {
                    debug!(key = %unit.key, strategy = strategy.name(), "no match; falling back");
                }
                Err(err) => {
                    debug!(key = %unit.key, strategy = strategy.name(), error = %err, "strategy failed; falling back");
                    errors.push((strategy.name(), err));
                }
            }
        }
        if errors.is_empty() {
            Resolution::NotFound
        } else {
            Resolution::Failed { errors }
        }
    }

    pub async fn resolve(&self, unit: &WorkUnit) -> Option<CanonicalRecord> {
        match self.resolve_detailed(unit).await {
            Resolution::Found { record, .. } => Some(record),
            _ => None,
        }
    }

    /// Primary, secondary and synthetic strategies for every configured source.
    pub fn from_config(cfg: &HarvestConfig, limiter: Arc<RateLimiter>) -> Result<Self> {
        let mut resolver = Self::new(CallGate::new(limiter, cfg.retry));
        if let Some(primary) = &cfg.primary {
            let provider = DirectoryProvider::new(&primary.base_url, primary.timeout)
                .context("building primary client")?
                .with_api_key(cfg.primary_api_key.clone());
            resolver = resolver.with_strategy(FilterStrategy::new(Arc::new(provider)));
        }
        if let Some(secondary) = &cfg.secondary {
            let provider = OpenDataProvider::new(&secondary.base_url, secondary.timeout)
                .context("building secondary client")?;
            resolver = resolver.with_strategy(FilterStrategy::new(Arc::new(provider)));
        }
        if let Some(registry) = cfg.registry.as_ref().filter(|_| cfg.synthetic_probes > 0) {
            let provider = RegistryProvider::new(&registry.base_url, registry.timeout)
                .context("building registry client")?;
            let table: Arc<dyn PrefixTable> = match &cfg.prefix_table_path {
                Some(path) => Arc::new(StatePrefixTable::from_path(path)?),
                None => Arc::new(StatePrefixTable::embedded()?),
            };
            let mut probe = SyntheticProbe::new(Arc::new(provider), table, cfg.synthetic_probes);
            if let Some(seed) = cfg.synthetic_seed {
                probe = probe.with_seed(seed);
            }
            resolver = resolver.with_strategy(probe);
        }
        info!(strategies = ?resolver.strategy_names(), "resolver ready");
        Ok(resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{entity_json, unit, FakeFilterSource, FakeIdentifierSource, ProbeAnswer};
    use std::time::Duration;

    fn gate() -> CallGate {
        CallGate::new(
            Arc::new(RateLimiter::new(100, 100.0)),
            RetryPolicy::new(2, Duration::from_millis(10)),
        )
    }

    fn probe_with(answer: ProbeAnswer) -> (SyntheticProbe, Arc<FakeIdentifierSource>) {
        let source = Arc::new(FakeIdentifierSource::new(answer));
        let table = Arc::new(StatePrefixTable::embedded().unwrap());
        let probe = SyntheticProbe::new(source.clone(), table, 3).with_seed(7);
        (probe, source)
    }

    #[tokio::test]
    async fn secondary_answers_when_primary_misses() {
        let u = unit("3550308", "4711-3/02");
        let primary = Arc::new(FakeFilterSource::new("primary"));
        let secondary = Arc::new(
            FakeFilterSource::new("secondary")
                .respond(&u.key, Ok(entity_json("11222333000181", "MERCADO X LTDA", "4711302"))),
        );
        let (probe, probe_source) = probe_with(ProbeAnswer::Active("4711302".into()));

        let resolver = Resolver::new(gate())
            .with_strategy(FilterStrategy::new(primary.clone()))
            .with_strategy(FilterStrategy::new(secondary.clone()))
            .with_strategy(probe);

        match resolver.resolve_detailed(&u).await {
            Resolution::Found { record, strategy } => {
                assert_eq!(strategy, "secondary");
                assert_eq!(record.identifier.digits(), "11222333000181");
                assert_eq!(record.source, "secondary");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
        assert_eq!(probe_source.calls(), 0);
    }

    #[tokio::test]
    async fn transient_failure_falls_through() {
        let u = unit("3304557", "5611-2/01");
        let primary = FakeFilterSource::new("primary")
            .respond(&u.key, Err(SourceError::Unavailable("http 503".into())));
        let (probe, probe_source) = probe_with(ProbeAnswer::Active("5611201".into()));

        let resolver = Resolver::new(gate())
            .with_strategy(FilterStrategy::new(Arc::new(primary)))
            .with_strategy(probe);
        let rec = resolver.resolve(&u).await.unwrap();
        assert_eq!(rec.cnae_code.as_deref(), Some("5611201"));
        assert_eq!(probe_source.calls(), 1);
    }

    #[tokio::test]
    async fn outcome_distinguishes_not_found_from_failure() {
        let u = unit("3550308", "4711-3/02");
        let quiet = Resolver::new(gate())
            .with_strategy(FilterStrategy::new(Arc::new(FakeFilterSource::new("a"))))
            .with_strategy(FilterStrategy::new(Arc::new(FakeFilterSource::new("b"))));
        assert_eq!(quiet.resolve_detailed(&u).await, Resolution::NotFound);

        let flaky = Resolver::new(gate())
            .with_strategy(FilterStrategy::new(Arc::new(
                FakeFilterSource::new("a").respond(&u.key, Err(SourceError::Unavailable("timeout".into()))),
            )))
            .with_strategy(FilterStrategy::new(Arc::new(FakeFilterSource::new("b"))));
        match flaky.resolve_detailed(&u).await {
            Resolution::Failed { errors } => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].0, "a");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_source_is_retried_once_then_skipped() {
        let u = unit("3550308", "4711-3/02");
        let primary = Arc::new(
            FakeFilterSource::new("primary").respond(&u.key, Err(SourceError::RateLimited { retry_after: None })),
        );
        let secondary = Arc::new(
            FakeFilterSource::new("secondary")
                .respond(&u.key, Ok(entity_json("33000167000101", "PETRO SA", "4711302"))),
        );
        let resolver = Resolver::new(gate())
            .with_strategy(FilterStrategy::new(primary.clone()))
            .with_strategy(FilterStrategy::new(secondary.clone()));
        assert!(resolver.resolve(&u).await.is_some());
        assert_eq!(primary.calls(), 2);
        assert_eq!(secondary.calls(), 1);
    }
}
