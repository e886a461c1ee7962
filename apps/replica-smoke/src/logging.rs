//! Tracing bootstrap for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,replica_smoke=debug,replica_client=debug";

/// Install the global subscriber.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `REPLICA_SMOKE_LOG`
/// 3) `REPLICA_LOG`
/// 4) internal default filter
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    filter_from_lookup(|key| env::var(key).ok())
}

fn filter_from_lookup<F>(mut lookup: F) -> EnvFilter
where
    F: FnMut(&str) -> Option<String>,
{
    for key in ["REPLICA_SMOKE_LOG", "REPLICA_LOG"] {
        if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_specific_filter_wins_over_shared_one() {
        let filter = filter_from_lookup(|key| match key {
            "REPLICA_SMOKE_LOG" => Some("warn".to_owned()),
            "REPLICA_LOG" => Some("trace".to_owned()),
            _ => None,
        });
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn blank_values_fall_through_to_default() {
        let filter = filter_from_lookup(|key| match key {
            "REPLICA_SMOKE_LOG" => Some("  ".to_owned()),
            _ => None,
        });
        assert_eq!(filter.to_string(), EnvFilter::new(DEFAULT_FILTER).to_string());
    }
}
