use crate::application::ReconciliationConfig;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// Price recorded when a provider event carries no price reference.
    pub fallback_price_id: String,
    pub database_max_connections: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder()?
            .set_override_option("database_url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("fallback_price_id", std::env::var("STRIPE_PRICE_ID").ok())?
            .build()?
            .try_deserialize()
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("BILLING")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .set_default("database_max_connections", 5)
    }

    pub fn reconciliation(&self) -> ReconciliationConfig {
        ReconciliationConfig {
            fallback_price_id: self.fallback_price_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_pool_size() {
        let config: AppConfig = AppConfig::builder()
            .unwrap()
            .set_override("database_url", "postgres://localhost/billing")
            .unwrap()
            .set_override("fallback_price_id", "price_default")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.database_max_connections, 5);
        assert_eq!(config.reconciliation().fallback_price_id, "price_default");
    }

    #[test]
    fn missing_fallback_price_is_rejected() {
        let result: Result<AppConfig, _> = AppConfig::builder()
            .unwrap()
            .set_override("database_url", "postgres://localhost/billing")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize();

        assert!(result.is_err());
    }
}
