//! Tolerant field extraction shared by the source adapters.
use chrono::NaiveDate;
use serde_json::Value;

/// First non-empty string found under any of `keys`. Numbers are stringified.
pub fn text(obj: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::String(s) => {
            let t = s.trim();
            (!t.is_empty()).then(|| t.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Follows a dotted path (`address.city.code`) and returns the text found there.
pub fn text_at(obj: &Value, path: &str) -> Option<String> {
    let mut cur = obj;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            return text(cur, &[part]);
        }
        cur = cur.get(part)?;
    }
    None
}

/// Accepts numbers, `"1234.56"` and Brazilian formatted `"1.234,56"`.
pub fn money(obj: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_money(s),
        _ => None,
    })
}

pub fn parse_money(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches("R$")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let normalized = if cleaned.contains(',') {
        cleaned.replace('.', "").replace(',', ".")
    } else {
        cleaned
    };
    normalized.parse::<f64>().ok()
}

/// Accepts `YYYY-MM-DD`, `DD/MM/YYYY` and RFC 3339 timestamps.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    let head = t.get(..10).unwrap_or(t);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%d/%m/%Y"))
        .ok()
}

pub fn date(obj: &Value, keys: &[&str]) -> Option<NaiveDate> {
    text(obj, keys).as_deref().and_then(parse_date)
}

/// Keeps only digits; empty results become `None`.
pub fn digits_only(raw: &str) -> Option<String> {
    let d: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (!d.is_empty()).then_some(d)
}

/// First array found under any of `keys`.
pub fn array<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    keys.iter().find_map(|k| obj.get(*k)?.as_array())
}
