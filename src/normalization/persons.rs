//! Affiliated-person extraction, including the inferred titular of
//! individual-proprietor entities.
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::identifier::CandidateIdentifier;
use crate::model::{AffiliatedPerson, CanonicalRecord};

/// Role given to a person derived from the entity name.
pub const TITULAR_ROLE: &str = "titular";

/// Trailing tokens that mark an individual-proprietor style entity.
const PROPRIETOR_SUFFIXES: [&str; 5] = ["ME", "MEI", "EI", "EPP", "EIRELI"];

/// Company forms that rule out a single proprietor, compared on letters only
/// (`S/A` and `S.A.` both read `SA`).
const CORPORATE_FORMS: [&str; 4] = ["LTDA", "LIMITADA", "SA", "CIA"];

fn document_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\d.\-/]*\d[\d.\-/]*$").expect("static regex"))
}

fn is_separator(token: &str) -> bool {
    token.chars().all(|c| matches!(c, '-' | '–' | '/' | ',' | '.'))
}

fn bare(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

fn suffix_token(token: &str) -> bool {
    PROPRIETOR_SUFFIXES.contains(&bare(token).as_str())
}

fn ends_in_corporate_form(name: &str) -> bool {
    name.split_whitespace()
        .next_back()
        .is_some_and(|last| CORPORATE_FORMS.contains(&bare(last).as_str()))
}

fn individual_legal_nature(nature: Option<&str>) -> bool {
    let Some(raw) = nature else {
        return false;
    };
    let upper = raw.to_uppercase();
    let code: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    code.starts_with("2135")
        || code.starts_with("2305")
        || ((upper.contains("EMPRESÁRIO") || upper.contains("EMPRESARIO"))
            && upper.contains("INDIVIDUAL"))
}

/// Strips proprietor suffixes and CPF-like digit runs from an entity name.
///
/// Returns the cleaned name and whether a proprietor suffix was present.
pub fn strip_proprietor_suffix(name: &str) -> (String, bool) {
    let mut tokens: Vec<&str> = name.split_whitespace().collect();
    let mut had_suffix = false;

    while let Some(last) = tokens.last() {
        if suffix_token(last) {
            had_suffix = true;
        } else if !(is_separator(last) || document_like().is_match(last)) {
            break;
        }
        tokens.pop();
    }
    while let Some(first) = tokens.first() {
        if is_separator(first) || document_like().is_match(first) {
            tokens.remove(0);
        } else {
            break;
        }
    }
    (tokens.join(" "), had_suffix)
}

/// The single inferred titular for a record with no explicit persons, if the
/// entity looks like an individual proprietorship.
pub fn infer_titular(record: &CanonicalRecord) -> Option<AffiliatedPerson> {
    if !record.persons.is_empty() {
        return None;
    }
    let (cleaned, had_suffix) = strip_proprietor_suffix(&record.legal_name);
    // ME and EPP also mark the size class of ordinary companies.
    let by_suffix = had_suffix && !ends_in_corporate_form(&cleaned);
    if !(by_suffix || individual_legal_nature(record.legal_nature.as_deref())) {
        return None;
    }
    if cleaned.is_empty() {
        return None;
    }
    Some(AffiliatedPerson {
        name: cleaned,
        role: Some(TITULAR_ROLE.to_string()),
        joined_on: record.founded_on,
        document: None,
    })
}

/// Persons to persist for a record: the explicit list, or the inferred titular.
pub fn extract_persons(record: &CanonicalRecord) -> Vec<AffiliatedPerson> {
    if record.persons.is_empty() {
        infer_titular(record).into_iter().collect()
    } else {
        record
            .persons
            .iter()
            .filter(|p| !p.name.trim().is_empty())
            .cloned()
            .collect()
    }
}

/// Stable identity for a person: normalised name plus masked document.
///
/// An inferred titular carries no document, so its key is scoped to the
/// entity it was derived from instead.
pub fn person_key(person: &AffiliatedPerson, entity: &CandidateIdentifier) -> String {
    let name = person
        .name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();
    let doc = person.document.as_deref().unwrap_or("").trim();
    let material = if doc.is_empty() && person.role.as_deref() == Some(TITULAR_ROLE) {
        format!("{name}|{TITULAR_ROLE}:{}", entity.digits())
    } else {
        format!("{name}|{doc}")
    };
    format!("{:x}", Sha256::digest(material.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::validate;

    fn record(name: &str) -> CanonicalRecord {
        CanonicalRecord::new(validate("11222333000181").unwrap(), name, "test")
    }

    #[test]
    fn strips_suffixes_and_documents() {
        assert_eq!(
            strip_proprietor_suffix("JOAO DA SILVA ME"),
            ("JOAO DA SILVA".to_string(), true)
        );
        assert_eq!(
            strip_proprietor_suffix("MARIA SOUZA - M.E."),
            ("MARIA SOUZA".to_string(), true)
        );
        assert_eq!(
            strip_proprietor_suffix("12.345.678 ANA LIMA 12345678900"),
            ("ANA LIMA".to_string(), false)
        );
        assert_eq!(
            strip_proprietor_suffix("COMERCIO DE ALIMENTOS LTDA"),
            ("COMERCIO DE ALIMENTOS LTDA".to_string(), false)
        );
    }

    #[test]
    fn infers_exactly_one_titular() {
        let rec = record("JOSE PEREIRA 12345678900 MEI");
        let persons = extract_persons(&rec);
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].name, "JOSE PEREIRA");
        assert_eq!(persons[0].role.as_deref(), Some(TITULAR_ROLE));
    }

    #[test]
    fn legal_nature_alone_is_enough() {
        let mut rec = record("PADARIA BOM DIA");
        assert!(infer_titular(&rec).is_none());
        rec.legal_nature = Some("213-5 - Empresário (Individual)".into());
        let p = infer_titular(&rec).unwrap();
        assert_eq!(p.name, "PADARIA BOM DIA");
    }

    #[test]
    fn explicit_persons_win() {
        let mut rec = record("JOAO DA SILVA ME");
        rec.persons.push(AffiliatedPerson {
            name: "JOAO DA SILVA".into(),
            role: Some("Sócio-Administrador".into()),
            joined_on: None,
            document: Some("***123456**".into()),
        });
        assert!(infer_titular(&rec).is_none());
        assert_eq!(extract_persons(&rec).len(), 1);
        assert_eq!(extract_persons(&rec)[0].role.as_deref(), Some("Sócio-Administrador"));
    }

    #[test]
    fn person_key_ignores_spacing_and_case() {
        let a = AffiliatedPerson {
            name: "Ana  Lima".into(),
            role: None,
            joined_on: None,
            document: None,
        };
        let b = AffiliatedPerson {
            name: "ANA LIMA".into(),
            role: Some("x".into()),
            joined_on: None,
            document: None,
        };
        let owner = validate("11222333000181").unwrap();
        let other = validate("11444777000161").unwrap();
        assert_eq!(person_key(&a, &owner), person_key(&b, &owner));
        // partners are shared across entities
        assert_eq!(person_key(&a, &owner), person_key(&a, &other));
        let c = AffiliatedPerson {
            document: Some("***1**".into()),
            ..b
        };
        assert_ne!(person_key(&a, &owner), person_key(&c, &owner));
    }

    #[test]
    fn size_class_suffix_on_a_company_is_not_a_titular() {
        for name in [
            "ACME COMERCIO DE PECAS LTDA EPP",
            "ACME COMERCIO DE PECAS LTDA - ME",
            "CONSTRUTORA BETA S/A EPP",
            "CONSTRUTORA BETA S.A. ME",
        ] {
            assert!(infer_titular(&record(name)).is_none(), "{name}");
        }
        assert_eq!(infer_titular(&record("ANA LIMA EPP")).unwrap().name, "ANA LIMA");

        let mut rec = record("ACME COMERCIO LTDA ME");
        rec.legal_nature = Some("213-5 - Empresário (Individual)".into());
        assert!(infer_titular(&rec).is_some());
    }

    #[test]
    fn same_name_titulars_of_different_entities_stay_apart() {
        let first = record("MARIA DA SILVA MEI");
        let mut second = first.clone();
        second.identifier = validate("11444777000161").unwrap();
        let a = infer_titular(&first).unwrap();
        let b = infer_titular(&second).unwrap();
        assert_eq!(a, b);
        assert_ne!(person_key(&a, &first.identifier), person_key(&b, &second.identifier));
        assert_eq!(person_key(&a, &first.identifier), person_key(&a, &first.identifier));
    }
}
