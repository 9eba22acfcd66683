use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use super::env_parsing::{parse_csv_env, parse_env_bool, parse_env_number};
use super::AppConfig;

pub fn load_from_path(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    Ok(cfg)
}

pub fn load_from_env_or_default(default_path: &Path) -> Result<(AppConfig, PathBuf)> {
    let configured = env::var("DEXQUOTE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_path.to_path_buf());
    let mut config = if configured.exists() {
        load_from_path(&configured)?
    } else {
        AppConfig::default()
    };

    if let Ok(log_level) = env::var("DEXQUOTE_LOG_LEVEL") {
        let trimmed = log_level.trim();
        if !trimmed.is_empty() {
            config.system.log_level = trimmed.to_string();
        }
    }
    if let Some(log_json) = env::var("DEXQUOTE_LOG_JSON").ok().and_then(parse_env_bool) {
        config.system.log_json = log_json;
    }

    if let Ok(provider) = env::var("DEXQUOTE_SOURCE_PROVIDER") {
        let trimmed = provider.trim();
        if !trimmed.is_empty() {
            config.source.provider = trimmed.to_string();
        }
    }
    if let Ok(grpc_url) = env::var("DEXQUOTE_GRPC_URL") {
        config.source.grpc_url = grpc_url;
    }
    if let Ok(x_token) = env::var("DEXQUOTE_GRPC_X_TOKEN") {
        config.source.grpc_x_token = x_token;
    }
    if let Ok(ws_url) = env::var("DEXQUOTE_WS_URL") {
        config.source.ws_url = ws_url;
    }
    if let Ok(commitment) = env::var("DEXQUOTE_COMMITMENT") {
        let trimmed = commitment.trim().to_ascii_lowercase();
        if !trimmed.is_empty() {
            config.source.commitment = trimmed;
        }
    }
    if let Ok(program_ids_csv) = env::var("DEXQUOTE_WATCH_PROGRAM_IDS") {
        let values = parse_csv_env(&program_ids_csv);
        if !values.is_empty() {
            config.source.watch_program_ids = values;
        }
    }
    if let Some(connect_timeout_ms) = env::var("DEXQUOTE_CONNECT_TIMEOUT_MS")
        .ok()
        .and_then(parse_env_number)
    {
        config.source.connect_timeout_ms = connect_timeout_ms;
    }
    if let Some(reconnect_initial_ms) = env::var("DEXQUOTE_RECONNECT_INITIAL_MS")
        .ok()
        .and_then(parse_env_number)
    {
        config.source.reconnect_initial_ms = reconnect_initial_ms;
    }
    if let Some(reconnect_max_ms) = env::var("DEXQUOTE_RECONNECT_MAX_MS")
        .ok()
        .and_then(parse_env_number)
    {
        config.source.reconnect_max_ms = reconnect_max_ms;
    }
    if let Some(queue_capacity) = env::var("DEXQUOTE_QUEUE_CAPACITY")
        .ok()
        .and_then(parse_env_number)
    {
        config.source.queue_capacity = queue_capacity;
    }
    if let Ok(policy) = env::var("DEXQUOTE_QUEUE_OVERFLOW_POLICY") {
        let trimmed = policy.trim();
        if !trimmed.is_empty() {
            config.source.queue_overflow_policy = trimmed.to_string();
        }
    }
    if let Some(seen_signatures_limit) = env::var("DEXQUOTE_SEEN_SIGNATURES_LIMIT")
        .ok()
        .and_then(parse_env_number)
    {
        config.source.seen_signatures_limit = seen_signatures_limit;
    }
    if let Some(seen_signatures_ttl_ms) = env::var("DEXQUOTE_SEEN_SIGNATURES_TTL_MS")
        .ok()
        .and_then(parse_env_number)
    {
        config.source.seen_signatures_ttl_ms = seen_signatures_ttl_ms;
    }
    if let Some(telemetry_report_seconds) = env::var("DEXQUOTE_TELEMETRY_REPORT_SECONDS")
        .ok()
        .and_then(parse_env_number)
    {
        config.source.telemetry_report_seconds = telemetry_report_seconds;
    }

    if let Some(max_megabytes) = env::var("DEXQUOTE_CACHE_MAX_MEGABYTES")
        .ok()
        .and_then(parse_env_number)
    {
        config.cache.max_megabytes = max_megabytes;
    }
    if let Some(cleanup_threshold) = env::var("DEXQUOTE_CACHE_CLEANUP_THRESHOLD")
        .ok()
        .and_then(parse_env_number::<f64>)
    {
        config.cache.cleanup_threshold = cleanup_threshold;
    }

    if let Ok(host) = env::var("DEXQUOTE_API_HOST") {
        let trimmed = host.trim();
        if !trimmed.is_empty() {
            config.api.host = trimmed.to_string();
        }
    }
    if let Some(port) = env::var("DEXQUOTE_API_PORT").ok().and_then(parse_env_number) {
        config.api.port = port;
    }

    if let Ok(rpc_http_url) = env::var("DEXQUOTE_RPC_HTTP_URL") {
        config.rpc.http_url = rpc_http_url;
    }
    if let Some(request_timeout_ms) = env::var("DEXQUOTE_RPC_REQUEST_TIMEOUT_MS")
        .ok()
        .and_then(parse_env_number)
    {
        config.rpc.request_timeout_ms = request_timeout_ms;
    }

    if let Some(enabled) = env::var("DEXQUOTE_FALLBACK_ENABLED")
        .ok()
        .and_then(parse_env_bool)
    {
        config.fallback.enabled = enabled;
    }
    if let Ok(quote_url) = env::var("DEXQUOTE_FALLBACK_QUOTE_URL") {
        config.fallback.quote_url = quote_url;
    }
    if let Some(probe_lamports) = env::var("DEXQUOTE_FALLBACK_PROBE_LAMPORTS")
        .ok()
        .and_then(parse_env_number)
    {
        config.fallback.probe_lamports = probe_lamports;
    }

    validate(&config)?;

    Ok((config, configured))
}

fn validate(config: &AppConfig) -> Result<()> {
    match config.source.provider.trim().to_ascii_lowercase().as_str() {
        "grpc" | "ws" | "mock" => {}
        other => {
            return Err(anyhow!(
                "source.provider must be one of grpc/ws/mock, got: {other}"
            ))
        }
    }
    match config.source.commitment.trim().to_ascii_lowercase().as_str() {
        "processed" | "confirmed" | "finalized" => {}
        other => {
            return Err(anyhow!(
                "source.commitment must be one of processed/confirmed/finalized, got: {other}"
            ))
        }
    }
    if config.cache.max_megabytes == 0 {
        return Err(anyhow!("cache.max_megabytes must be positive"));
    }
    if !(0.0..=1.0).contains(&config.cache.cleanup_threshold) {
        return Err(anyhow!(
            "cache.cleanup_threshold must be within [0.0, 1.0], got: {}",
            config.cache.cleanup_threshold
        ));
    }
    Ok(())
}
