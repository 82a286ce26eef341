use std::sync::Arc;

use async_trait::async_trait;

use super::{CallGate, ResolutionStrategy};
use crate::error::SourceError;
use crate::model::{CanonicalRecord, WorkUnit};
use crate::providers::FilterSource;

/// Direct lookup by municipality and activity code.
pub struct FilterStrategy {
    source: Arc<dyn FilterSource>,
}

impl FilterStrategy {
    pub fn new(source: Arc<dyn FilterSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ResolutionStrategy for FilterStrategy {
    fn name(&self) -> &'static str {
        self.source.name()
    }

    async fn attempt(&self, unit: &WorkUnit, gate: &CallGate) -> Result<CanonicalRecord, SourceError> {
        let raw = gate
            .call(self.source.name(), || {
                self.source.lookup_by_filter(&unit.location, &unit.category)
            })
            .await?;
        self.source
            .normalize(&raw)
            .ok_or_else(|| SourceError::Decode(format!("{} returned an unmappable record", self.source.name())))
    }
}
