pub mod checkpoint;
pub mod config;
pub mod enumerator;
pub mod error;
pub mod identifier;
pub mod logging;
pub mod model;
pub mod normalization;
pub mod persister;
pub mod pipeline;
pub mod prefix_table;
pub mod progress;
pub mod providers;
pub mod rate_limiter;
pub mod reference;
pub mod resolver;
pub mod retry;
pub mod storage;
pub mod worker;

pub mod util {
    pub mod db;
    pub mod env;
}

#[cfg(test)]
mod testing;

pub use config::HarvestConfig;
pub use identifier::CandidateIdentifier;
pub use model::{CanonicalRecord, Counters, Key};
pub use pipeline::{Pipeline, PipelineOptions, RunSummary};
