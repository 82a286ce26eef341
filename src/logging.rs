use anyhow::{anyhow, Context};
use tracing_subscriber::EnvFilter;

use crate::util::env::env_flag;

/// Target used for the periodic status line.
pub const PROGRESS_TARGET: &str = "progress";

/// Filter applied when `RUST_LOG` is unset: run events at info, HTTP and
/// database drivers only when they warn.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn,hyper=warn,reqwest=warn";

/// Installs the process-wide fmt subscriber.
///
/// `RUST_LOG` overrides `default_filter`. `HARVEST_LOG_ANSI=0` turns colours
/// off for runs whose output goes to a file.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .with_context(|| format!("invalid log filter {default_filter:?}"))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(env_flag("HARVEST_LOG_ANSI", true))
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .try_init()
        .map_err(|e| anyhow!("tracing already initialised: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_once() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
        let _ = init_tracing(DEFAULT_FILTER);
        assert!(init_tracing(DEFAULT_FILTER).is_err());
    }
}
