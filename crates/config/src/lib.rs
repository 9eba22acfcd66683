mod env_parsing;
mod loader;
mod schema;

pub use self::loader::{load_from_env_or_default, load_from_path};
pub use self::schema::{
    ApiConfig, AppConfig, CacheConfig, FallbackConfig, RpcConfig, SourceConfig, SystemConfig,
};

#[cfg(test)]
mod tests;
