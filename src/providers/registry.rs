use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{build_client, read_json, IdentifierSource, RawRecord};
use crate::error::SourceError;
use crate::identifier::{self, CandidateIdentifier};
use crate::model::{Address, AffiliatedPerson, CanonicalRecord, EntityStatus};
use crate::normalization::fields::{array, date, digits_only, money, text};

/// Public registry lookup by identifier: `GET {base}/{cnpj}`.
/// Used by the synthetic probe.
#[derive(Debug, Clone)]
pub struct RegistryProvider {
    base_url: String,
    http: Client,
}

impl RegistryProvider {
    pub const NAME: &'static str = "registry";

    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: build_client("cnpj-harvest/0.1 (registry)", timeout)?,
        })
    }
}

#[async_trait]
impl IdentifierSource for RegistryProvider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn lookup_by_identifier(
        &self,
        id: &CandidateIdentifier,
    ) -> Result<RawRecord, SourceError> {
        let url = format!("{}/{}", self.base_url, id.digits());
        let resp = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;
        let payload = read_json(resp).await?;
        if payload.get("cnpj").is_none() {
            return Err(SourceError::NotFound);
        }
        Ok(RawRecord(payload))
    }

    fn normalize(&self, raw: &RawRecord) -> Option<CanonicalRecord> {
        normalize(&raw.0)
    }
}

pub fn normalize(obj: &Value) -> Option<CanonicalRecord> {
    let identifier = identifier::validate(&text(obj, &["cnpj"])?).ok()?;
    let legal_name = text(obj, &["razao_social"])?;

    let status = text(obj, &["descricao_situacao_cadastral", "situacao_cadastral"])
        .map(|s| EntityStatus::parse(&s))
        .unwrap_or_default();

    let street = match (
        text(obj, &["descricao_tipo_de_logradouro"]),
        text(obj, &["logradouro"]),
    ) {
        (Some(kind), Some(street)) if !street.starts_with(&kind) => Some(format!("{kind} {street}")),
        (_, street) => street,
    };

    let persons = array(obj, &["qsa"])
        .map(|entries| {
            entries
                .iter()
                .filter_map(|p| {
                    Some(AffiliatedPerson {
                        name: text(p, &["nome_socio"])?,
                        role: text(p, &["qualificacao_socio"]),
                        joined_on: date(p, &["data_entrada_sociedade"]),
                        document: text(p, &["cnpj_cpf_do_socio"]),
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
        cnae_code: text(obj, &["cnae_fiscal"]).and_then(|c| digits_only(&c)),
        address: Address {
            street,
            number: text(obj, &["numero"]),
            complement: text(obj, &["complemento"]),
            district: text(obj, &["bairro"]),
            postal_code: text(obj, &["cep"]).and_then(|c| digits_only(&c)),
            municipality_code: text(obj, &["codigo_municipio_ibge"]),
            municipality_name: text(obj, &["municipio"]),
            state: text(obj, &["uf"]),
        },
        founded_on: date(obj, &["data_inicio_atividade"]),
        size: text(obj, &["porte", "descricao_porte"]),
        share_capital: money(obj, &["capital_social"]),
        legal_nature: text(obj, &["natureza_juridica"]),
        persons,
        source: RegistryProvider::NAME.to_string(),
    })
}
