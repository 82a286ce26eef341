//! In-memory fakes shared by the unit tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::SourceError;
use crate::identifier::{self, CandidateIdentifier};
use crate::model::{AffiliatedPerson, CanonicalRecord, Category, EntityStatus, Key, Location, WorkUnit};
use crate::providers::{FilterSource, IdentifierSource, RawRecord};

pub fn location(code: &str, state: &str, weight: f64) -> Location {
    Location {
        code: code.into(),
        name: format!("City {code}"),
        state: state.into(),
        weight,
    }
}

pub fn category(code: &str) -> Category {
    Category {
        code: code.into(),
        description: String::new(),
    }
}

pub fn unit(location_code: &str, category_code: &str) -> WorkUnit {
    WorkUnit::new(
        Arc::new(location(location_code, "SP", 1.0)),
        Arc::new(category(category_code)),
    )
}

pub fn entity_json(cnpj: &str, name: &str, cnae: &str) -> Value {
    json!({"cnpj": cnpj, "name": name, "cnae": cnae, "status": "ATIVA"})
}

fn normalize_fake(v: &Value, source: &str) -> Option<CanonicalRecord> {
    let id = identifier::validate(v.get("cnpj")?.as_str()?).ok()?;
    let mut rec = CanonicalRecord::new(id, v.get("name")?.as_str()?, source);
    rec.status = EntityStatus::parse(v.get("status").and_then(Value::as_str).unwrap_or(""));
    rec.cnae_code = v.get("cnae").and_then(Value::as_str).map(str::to_string);
    rec.legal_nature = v.get("nature").and_then(Value::as_str).map(str::to_string);
    if let Some(persons) = v.get("persons").and_then(Value::as_array) {
        rec.persons = persons
            .iter()
            .filter_map(|p| {
                Some(AffiliatedPerson {
                    name: p.get("name")?.as_str()?.to_string(),
                    role: p.get("role").and_then(Value::as_str).map(str::to_string),
                    joined_on: None,
                    document: None,
                })
            })
            .collect();
    }
    Some(rec)
}

type CallHook = Box<dyn Fn(usize) + Send + Sync>;

/// Answers from a fixed table; unknown keys are not found.
pub struct FakeFilterSource {
    name: &'static str,
    responses: HashMap<Key, Result<Value, SourceError>>,
    calls: AtomicUsize,
    on_call: Option<CallHook>,
}

impl FakeFilterSource {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            responses: HashMap::new(),
            calls: AtomicUsize::new(0),
            on_call: None,
        }
    }

    pub fn respond(mut self, key: &Key, response: Result<Value, SourceError>) -> Self {
        self.responses.insert(key.clone(), response);
        self
    }

    /// Runs `hook` with the 1-based call count on every lookup.
    pub fn on_call(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FilterSource for FakeFilterSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn lookup_by_filter(
        &self,
        location: &Location,
        category: &Category,
    ) -> Result<RawRecord, SourceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = &self.on_call {
            hook(n);
        }
        tokio::task::yield_now().await;
        match self.responses.get(&Key::of(location, category)) {
            Some(Ok(v)) => Ok(RawRecord(v.clone())),
            Some(Err(e)) => Err(e.clone()),
            None => Err(SourceError::NotFound),
        }
    }

    fn normalize(&self, raw: &RawRecord) -> Option<CanonicalRecord> {
        normalize_fake(&raw.0, self.name)
    }
}

#[derive(Debug, Clone)]
pub enum ProbeAnswer {
    NotFound,
    Active(String),
    Closed(String),
    Fail(SourceError),
}

/// Registry fake that answers every identifier the same way.
pub struct FakeIdentifierSource {
    answer: ProbeAnswer,
    calls: AtomicUsize,
}

impl FakeIdentifierSource {
    pub fn new(answer: ProbeAnswer) -> Self {
        Self {
            answer,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentifierSource for FakeIdentifierSource {
    fn name(&self) -> &'static str {
        "fake_registry"
    }

    async fn lookup_by_identifier(&self, id: &CandidateIdentifier) -> Result<RawRecord, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (status, cnae) = match &self.answer {
            ProbeAnswer::NotFound => return Err(SourceError::NotFound),
            ProbeAnswer::Fail(err) => return Err(err.clone()),
            ProbeAnswer::Active(cnae) => ("ATIVA", cnae),
            ProbeAnswer::Closed(cnae) => ("BAIXADA", cnae),
        };
        Ok(RawRecord(json!({
            "cnpj": id.digits(),
            "name": "PROBED COMERCIO LTDA",
            "status": status,
            "cnae": cnae,
        })))
    }

    fn normalize(&self, raw: &RawRecord) -> Option<CanonicalRecord> {
        normalize_fake(&raw.0, "fake_registry")
    }
}
