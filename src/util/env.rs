//! `.env` loading and typed getters for the `HARVEST_*`, source and `DB_*`
//! settings. Every getter loads `.env` on first use.
use std::str::FromStr;
use std::sync::Once;
use tracing::{info, warn};

static INIT: Once = Once::new();

pub fn init_env() {
    INIT.call_once(|| {
        let _ = dotenv::dotenv();
    });
}

/// Trimmed-empty values count as unset.
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Parsed value, or `None` when unset. A value that does not parse is
/// logged and treated as unset.
pub fn env_parse_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    let raw = env_opt(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %redact_value(key, &raw), "ignoring unparsable setting");
            None
        }
    }
}

pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_parse_opt(key).unwrap_or(default)
}

/// 1/true/on/yes and 0/false/off/no, case-insensitive. Anything else keeps
/// `default` with a warning.
pub fn env_flag(key: &str, default: bool) -> bool {
    let Some(raw) = env_opt(key) else {
        return default;
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => true,
        "0" | "false" | "off" | "no" => false,
        other => {
            warn!(key, value = other, default, "unrecognised flag value");
            default
        }
    }
}

/// Database URL: `DATABASE_URL` first, then one composed from `DB_*` parts.
pub fn db_url() -> Option<String> {
    env_opt("DATABASE_URL").or_else(build_dsn_from_parts)
}

fn build_dsn_from_parts() -> Option<String> {
    let host = env_opt("DB_HOST")?;
    let user = env_opt("DB_USERNAME")?;
    let password = env_opt("DB_PASSWORD");
    let database = env_opt("DB_DATABASE").unwrap_or_else(|| "postgres".into());
    let port: u16 = env_parse("DB_PORT", 5432);
    let ssl_mode = env_opt("DB_SSLMODE").unwrap_or_else(|| "prefer".into());

    // Built via Url so reserved characters in credentials are percent-encoded.
    let mut out = url::Url::parse("postgresql://localhost").ok()?;
    out.set_username(&user).ok()?;
    if let Some(pass) = password {
        out.set_password(Some(&pass)).ok()?;
    }
    let host_trimmed = host.trim().trim_matches(|c| c == '[' || c == ']');
    if host_trimmed.contains(':') {
        out.set_host(Some(&format!("[{host_trimmed}]"))).ok()?;
    } else {
        out.set_host(Some(host_trimmed)).ok()?;
    }
    out.set_port(Some(port)).ok()?;
    out.set_path(&format!("/{database}"));
    if ssl_mode != "disable" {
        out.query_pairs_mut().append_pair("sslmode", &ssl_mode);
    }
    Some(out.to_string())
}

pub fn redact_value(key: &str, val: &str) -> String {
    let k = key.to_ascii_uppercase();
    if k.contains("PASSWORD") || k.contains("SECRET") || k.contains("KEY") || k.contains("TOKEN") {
        return "***".to_string();
    }
    let val_trim = val.trim();
    if let Ok(mut u) = url::Url::parse(val_trim) {
        let scheme = u.scheme().to_ascii_lowercase();
        if scheme == "postgres" || scheme == "postgresql" {
            let _ = u.set_username("***");
            let _ = u.set_password(Some("***"));
            return u.to_string();
        }
    }
    val_trim.to_string()
}

/// Log a redacted snapshot of the given keys.
pub fn log_snapshot(title: &str, keys: &[&str]) {
    init_env();
    let snapshot: Vec<(String, String)> = keys
        .iter()
        .filter_map(|&k| env_opt(k).map(|v| (k.to_string(), redact_value(k, &v))))
        .collect();
    info!(target = "preflight", title, snapshot = ?snapshot, "configuration snapshot");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_fall_back_on_bad_values() {
        std::env::set_var("HARVEST_ENV_TEST_NUM", " 12 ");
        std::env::set_var("HARVEST_ENV_TEST_BAD", "twelve");
        std::env::set_var("HARVEST_ENV_TEST_OFF", "off");
        std::env::set_var("HARVEST_ENV_TEST_ODD", "maybe");
        std::env::set_var("HARVEST_ENV_TEST_BLANK", "   ");
        assert_eq!(env_parse("HARVEST_ENV_TEST_NUM", 3u32), 12);
        assert_eq!(env_parse("HARVEST_ENV_TEST_BAD", 3u32), 3);
        assert_eq!(env_parse_opt::<u32>("HARVEST_ENV_TEST_BAD"), None);
        assert_eq!(env_opt("HARVEST_ENV_TEST_BLANK"), None);
        assert!(!env_flag("HARVEST_ENV_TEST_OFF", true));
        assert!(env_flag("HARVEST_ENV_TEST_ODD", true));
        assert!(!env_flag("HARVEST_ENV_TEST_UNSET", false));
    }

    #[test]
    fn redacts_secrets_and_dsn_credentials() {
        assert_eq!(redact_value("PRIMARY_API_KEY", "abc"), "***");
        let dsn = redact_value("DATABASE_URL", "postgres://bob:hunter2@db:5432/x");
        assert!(!dsn.contains("hunter2"));
        assert!(dsn.contains("db:5432"));
        assert_eq!(redact_value("HARVEST_RPS", " 3 "), "3");
    }
}
