use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub system: SystemConfig,
    pub source: SourceConfig,
    pub cache: CacheConfig,
    pub api: ApiConfig,
    pub rpc: RpcConfig,
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub env: String,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            env: "dev".to_string(),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Streaming provider: "grpc", "ws" or "mock".
    pub provider: String,
    pub grpc_url: String,
    pub grpc_x_token: String,
    pub ws_url: String,
    pub commitment: String,
    /// Program accounts to watch. Empty means "use the builder registry's
    /// supported set", which is the production default.
    pub watch_program_ids: Vec<String>,
    pub connect_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub grpc_ping_interval_secs: u64,
    pub ws_ping_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub queue_capacity: usize,
    pub queue_overflow_policy: String,
    pub seen_signatures_limit: usize,
    pub seen_signatures_ttl_ms: u64,
    pub telemetry_report_seconds: u64,
    pub mock_interval_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            provider: "grpc".to_string(),
            grpc_url: "REPLACE_ME".to_string(),
            grpc_x_token: "REPLACE_ME".to_string(),
            ws_url: "wss://atlas-mainnet.helius-rpc.com/?api-key=REPLACE_ME".to_string(),
            commitment: "confirmed".to_string(),
            watch_program_ids: Vec::new(),
            connect_timeout_ms: 30_000,
            reconnect_initial_ms: 5_000,
            reconnect_max_ms: 10_000,
            grpc_ping_interval_secs: 10,
            ws_ping_interval_secs: 30,
            idle_timeout_secs: 45,
            queue_capacity: 2_048,
            queue_overflow_policy: "block".to_string(),
            seen_signatures_limit: 5_000,
            seen_signatures_ttl_ms: 10 * 60 * 1_000,
            telemetry_report_seconds: 30,
            mock_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_megabytes: u64,
    pub cleanup_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_megabytes: 50,
            cleanup_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5551,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub http_url: String,
    pub request_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            http_url: "https://api.mainnet-beta.solana.com".to_string(),
            request_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    pub quote_url: String,
    pub probe_lamports: u64,
    pub timeout_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            quote_url: "https://quote-api.jup.ag/v6/quote".to_string(),
            probe_lamports: 1_000_000_000,
            timeout_ms: 3_000,
        }
    }
}
