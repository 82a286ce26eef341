use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{build_client, first_hit, read_json, FilterSource, RawRecord};
use crate::error::SourceError;
use crate::identifier;
use crate::model::{Address, AffiliatedPerson, CanonicalRecord, Category, EntityStatus, Location};
use crate::normalization::fields::{array, date, digits_only, money, text, text_at};

/// Company directory with an advanced search endpoint that filters by
/// municipality and activity code. Primary source.
///
/// `POST {base}/search` with `{"municipio": [...], "cnae": [...], "situacao": ["ATIVA"]}`.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    base_url: String,
    http: Client,
    api_key: Option<String>,
}

impl DirectoryProvider {
    pub const NAME: &'static str = "directory";

    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: build_client("cnpj-harvest/0.1 (directory)", timeout)?,
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|s| !s.trim().is_empty());
        self
    }

    fn search_body(location: &Location, category: &Category) -> Value {
        json!({
            "query": {
                "municipio": [location.code],
                "uf": [location.state],
                "atividade_principal": [category.digits()],
                "situacao_cadastral": ["ATIVA"],
            },
            "page": 1,
            "limit": 1,
        })
    }
}

#[async_trait]
impl FilterSource for DirectoryProvider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn lookup_by_filter(
        &self,
        location: &Location,
        category: &Category,
    ) -> Result<RawRecord, SourceError> {
        let url = format!("{}/search", self.base_url);
        let mut req = self
            .http
            .post(&url)
            .header("Accept", "application/json")
            .json(&Self::search_body(location, category));
        if let Some(key) = self.api_key.as_deref() {
            req = req.header("api-key", key);
        }
        let payload = read_json(req.send().await?).await?;
        match first_hit(&payload) {
            Some(hit) => Ok(RawRecord(hit.clone())),
            None => Err(SourceError::NotFound),
        }
    }

    fn normalize(&self, raw: &RawRecord) -> Option<CanonicalRecord> {
        normalize(&raw.0)
    }
}

pub fn normalize(obj: &Value) -> Option<CanonicalRecord> {
    let raw_id = text(obj, &["cnpj"])?;
    let identifier = match identifier::validate(&raw_id) {
        Ok(id) => id,
        Err(err) => {
            debug!(source = DirectoryProvider::NAME, raw = %raw_id, error = %err, "discarding invalid identifier");
            return None;
        }
    };
    let legal_name = text(obj, &["razao_social"])?;

    let status = text_at(obj, "situacao_cadastral.situacao_atual")
        .or_else(|| text(obj, &["situacao_cadastral", "situacao"]))
        .map(|s| EntityStatus::parse(&s))
        .unwrap_or_default();

    let cnae_code = text_at(obj, "atividade_principal.codigo")
        .or_else(|| text(obj, &["cnae_fiscal", "cnae"]))
        .and_then(|c| digits_only(&c));

    let addr = obj.get("endereco").unwrap_or(obj);
    let address = Address {
        street: text(addr, &["logradouro"]).map(|street| {
            match text(addr, &["tipo_logradouro"]) {
                Some(kind) => format!("{kind} {street}"),
                None => street,
            }
        }),
        number: text(addr, &["numero"]),
        complement: text(addr, &["complemento"]),
        district: text(addr, &["bairro"]),
        postal_code: text(addr, &["cep"]).and_then(|c| digits_only(&c)),
        municipality_code: text_at(addr, "ibge.codigo_municipio")
            .or_else(|| text(addr, &["codigo_municipio_ibge", "codigo_municipio"])),
        municipality_name: text(addr, &["municipio"]),
        state: text(addr, &["uf"]),
    };

    let persons = array(obj, &["quadro_societario", "qsa", "socios"])
        .map(|entries| {
            entries
                .iter()
                .filter_map(|p| {
                    Some(AffiliatedPerson {
                        name: text(p, &["nome", "nome_socio"])?,
                        role: text(p, &["qualificacao_socio", "qualificacao"]),
                        joined_on: date(p, &["data_entrada_sociedade", "data_entrada"]),
                        document: text(p, &["documento", "cpf_cnpj_socio"]),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(CanonicalRecord {
        identifier,
        legal_name,
        trade_name: text(obj, &["nome_fantasia"]),
        status,
        cnae_code,
        address,
        founded_on: date(obj, &["data_abertura", "data_inicio_atividade"]),
        size: text_at(obj, "porte_empresa.descricao").or_else(|| text(obj, &["porte"])),
        share_capital: money(obj, &["capital_social"]),
        legal_nature: text_at(obj, "natureza_juridica.descricao")
            .or_else(|| text(obj, &["natureza_juridica"])),
        persons,
        source: DirectoryProvider::NAME.to_string(),
    })
}
