//! Tracing/logging bootstrap for the probe.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,jobline_probe=debug,jobline_core=debug,jobline_net=debug";

/// Initialize global tracing subscriber with severity gating from environment.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `JOBLINE_PROBE_LOG`
/// 3) `JOBLINE_LOG`
/// 4) internal default filter
pub fn init() {
    let env_filter = filter_from_lookup(|key| env::var(key).ok());
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_env_filter(env_filter)
        .try_init();
}

fn filter_from_lookup<F>(lookup: F) -> EnvFilter
where
    F: Fn(&str) -> Option<String>,
{
    filter_spec(lookup)
        .and_then(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// First non-empty, parseable directive string in precedence order.
fn filter_spec<F>(lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    ["RUST_LOG", "JOBLINE_PROBE_LOG", "JOBLINE_LOG"]
        .into_iter()
        .filter_map(|key| lookup(key).filter(|value| !value.trim().is_empty()))
        .find(|value| EnvFilter::try_new(value).is_ok())
}
