use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{build_client, first_hit, read_json, FilterSource, RawRecord};
use crate::error::SourceError;
use crate::identifier;
use crate::model::{Address, AffiliatedPerson, CanonicalRecord, Category, EntityStatus, Location};
use crate::normalization::fields::{array, date, digits_only, money, text, text_at};

/// Open company dataset API with an English, camelCase schema and
/// different coverage than the directory. Secondary source.
///
/// `GET {base}/companies?municipality=..&activity=..&status=active&limit=1`
#[derive(Debug, Clone)]
pub struct OpenDataProvider {
    base_url: String,
    http: Client,
}

impl OpenDataProvider {
    pub const NAME: &'static str = "open_data";

    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: build_client("cnpj-harvest/0.1 (open-data)", timeout)?,
        })
    }
}

#[async_trait]
impl FilterSource for OpenDataProvider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn lookup_by_filter(
        &self,
        location: &Location,
        category: &Category,
    ) -> Result<RawRecord, SourceError> {
        let url = format!("{}/companies", self.base_url);
        let activity = category.digits();
        let resp = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .query(&[
                ("municipality", location.code.as_str()),
                ("activity", activity.as_str()),
                ("status", "active"),
                ("limit", "1"),
            ])
            .send()
            .await?;
        let payload = read_json(resp).await?;
        first_hit(&payload)
            .cloned()
            .map(RawRecord)
            .ok_or(SourceError::NotFound)
    }

    fn normalize(&self, raw: &RawRecord) -> Option<CanonicalRecord> {
        normalize(&raw.0)
    }
}

fn status_of(obj: &Value) -> EntityStatus {
    text_at(obj, "status.text")
        .or_else(|| text(obj, &["status"]))
        .map(|s| EntityStatus::parse(&s))
        .unwrap_or_default()
}

pub fn normalize(obj: &Value) -> Option<CanonicalRecord> {
    let identifier = identifier::validate(&text(obj, &["taxId", "tax_id"])?).ok()?;
    let legal_name = text_at(obj, "company.name").or_else(|| text(obj, &["name"]))?;

    let address = obj
        .get("address")
        .map(|a| Address {
            street: text(a, &["street"]),
            number: text(a, &["number"]),
            complement: text(a, &["details"]),
            district: text(a, &["district", "neighborhood"]),
            postal_code: text(a, &["zip"]).and_then(|z| digits_only(&z)),
            municipality_code: text_at(a, "city.code").or_else(|| text(a, &["municipality"])),
            municipality_name: text_at(a, "city.name").or_else(|| text(a, &["city"])),
            state: text(a, &["state"]),
        })
        .unwrap_or_default();

    let members = obj
        .get("company")
        .and_then(|c| array(c, &["members"]))
        .or_else(|| array(obj, &["members"]));
    let persons = members
        .map(|entries| {
            entries
                .iter()
                .filter_map(|m| {
                    let person = m.get("person").unwrap_or(m);
                    Some(AffiliatedPerson {
                        name: text(person, &["name"])?,
                        role: text_at(m, "role.text").or_else(|| text(m, &["role"])),
                        joined_on: date(m, &["since"]),
                        document: text(person, &["taxId"]),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(CanonicalRecord {
        identifier,
        legal_name,
        trade_name: text(obj, &["alias", "tradeName"]),
        status: status_of(obj),
        cnae_code: text_at(obj, "mainActivity.id")
            .or_else(|| text_at(obj, "mainActivity.code"))
            .and_then(|c| digits_only(&c)),
        address,
        founded_on: date(obj, &["founded"]),
        size: text_at(obj, "company.size.text").or_else(|| text_at(obj, "size.text")),
        share_capital: obj
            .get("company")
            .and_then(|c| money(c, &["equity"]))
            .or_else(|| money(obj, &["equity"])),
        legal_nature: text_at(obj, "company.nature.text").or_else(|| text_at(obj, "nature.text")),
        persons,
        source: OpenDataProvider::NAME.to_string(),
    })
}
