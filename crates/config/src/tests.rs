use super::*;
use std::env;
use std::sync::Mutex;

// Env mutation is process-global; serialize the tests that touch it.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn with_env_var<F: FnOnce()>(key: &str, value: &str, body: F) {
    let previous = env::var(key).ok();
    env::set_var(key, value);
    body();
    match previous {
        Some(previous) => env::set_var(key, previous),
        None => env::remove_var(key),
    }
}

#[test]
fn source_defaults_match_production_cadence() {
    let source = SourceConfig::default();
    assert_eq!(source.provider, "grpc");
    assert_eq!(source.commitment, "confirmed");
    assert_eq!(source.connect_timeout_ms, 30_000);
    assert_eq!(source.reconnect_initial_ms, 5_000);
    assert_eq!(source.reconnect_max_ms, 10_000);
    assert_eq!(source.grpc_ping_interval_secs, 10);
    assert_eq!(source.ws_ping_interval_secs, 30);
    assert!(source.watch_program_ids.is_empty());
}

#[test]
fn api_defaults_to_port_5551() {
    let api = ApiConfig::default();
    assert_eq!(api.port, 5551);
    assert_eq!(api.host, "0.0.0.0");
}

#[test]
fn cache_defaults() {
    let cache = CacheConfig::default();
    assert_eq!(cache.max_megabytes, 50);
    assert!((cache.cleanup_threshold - 0.85).abs() < 1e-9);
}

#[test]
fn env_overrides_apply_over_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    with_env_var("DEXQUOTE_SOURCE_PROVIDER", "ws", || {
        with_env_var("DEXQUOTE_API_PORT", "3001", || {
            with_env_var("DEXQUOTE_CACHE_MAX_MEGABYTES", "8", || {
                let (config, _) =
                    load_from_env_or_default(std::path::Path::new("does-not-exist.toml"))
                        .expect("defaults with env overrides must load");
                assert_eq!(config.source.provider, "ws");
                assert_eq!(config.api.port, 3001);
                assert_eq!(config.cache.max_megabytes, 8);
            });
        });
    });
}

#[test]
fn watch_program_ids_env_parses_csv_and_dedupes() {
    let _guard = ENV_LOCK.lock().unwrap();
    with_env_var("DEXQUOTE_WATCH_PROGRAM_IDS", "'prog-a, prog-b,prog-a,'", || {
        let (config, _) = load_from_env_or_default(std::path::Path::new("does-not-exist.toml"))
            .expect("csv program ids must load");
        assert_eq!(
            config.source.watch_program_ids,
            vec!["prog-a".to_string(), "prog-b".to_string()]
        );
    });
}

#[test]
fn unknown_provider_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    with_env_var("DEXQUOTE_SOURCE_PROVIDER", "carrier-pigeon", || {
        let err = load_from_env_or_default(std::path::Path::new("does-not-exist.toml"))
            .expect_err("unknown provider must fail validation")
            .to_string();
        assert!(err.contains("source.provider"), "unexpected error: {err}");
    });
}

#[test]
fn out_of_range_cleanup_threshold_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    with_env_var("DEXQUOTE_CACHE_CLEANUP_THRESHOLD", "1.5", || {
        let err = load_from_env_or_default(std::path::Path::new("does-not-exist.toml"))
            .expect_err("threshold above 1.0 must fail validation")
            .to_string();
        assert!(
            err.contains("cache.cleanup_threshold"),
            "unexpected error: {err}"
        );
    });
}
