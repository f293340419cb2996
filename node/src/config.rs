//! Node configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use closedloop_common::{Currency, LedgerError, UserId};
use closedloop_protocol::{EdiConfig, TelexConfig};
use closedloop_settlement::SettlementMethod;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(LedgerError::Configuration(format!(
                "unknown log format {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => f.write_str("json"),
            LogFormat::Pretty => f.write_str("pretty"),
        }
    }
}

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Postgres URL. Without one the node keeps the ledger in memory.
    pub database_url: Option<String>,
    pub max_db_connections: u32,
    /// Default tracing filter, overridden by `RUST_LOG`.
    pub log_level: String,
    pub log_format: LogFormat,
    /// Ledger currency for newly opened accounts.
    pub currency: Currency,
    /// Owner of the settlement accounts the node opens for correspondent banks.
    pub operator_id: UserId,
    pub sweep_interval: Duration,
    pub settlement_method: SettlementMethod,
    pub telex: TelexConfig,
    pub edi: EdiConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_db_connections: 10,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            currency: Currency::nvct(),
            operator_id: UserId::new(),
            sweep_interval: Duration::from_secs(60),
            settlement_method: SettlementMethod::Ach,
            telex: TelexConfig::default(),
            edi: EdiConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, LedgerError> {
        let mut config = Self::from_vars(|name| std::env::var(name).ok())?;
        config.telex = TelexConfig::from_env();
        config.edi = EdiConfig::from_env();
        Ok(config)
    }

    /// Build a configuration from a variable lookup.
    ///
    /// Empty values count as unset. Malformed values are errors.
    pub fn from_vars<F>(lookup: F) -> Result<Self, LedgerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        config.database_url = var("DATABASE_URL");
        if let Some(max) = var("DATABASE_MAX_CONNECTIONS") {
            config.max_db_connections = parse_number("DATABASE_MAX_CONNECTIONS", &max)?;
        }
        if let Some(level) = var("LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(format) = var("LOG_FORMAT") {
            config.log_format = format.parse()?;
        }
        if let Some(code) = var("LEDGER_CURRENCY") {
            config.currency = Currency::new(code.trim().to_ascii_uppercase());
        }
        if let Some(id) = var("NODE_OPERATOR_ID") {
            config.operator_id = UserId::parse(id.trim()).map_err(|e| {
                LedgerError::Configuration(format!("NODE_OPERATOR_ID is not a UUID: {}", e))
            })?;
        }
        if let Some(secs) = var("SETTLEMENT_SWEEP_INTERVAL_SECS") {
            config.sweep_interval =
                Duration::from_secs(parse_number("SETTLEMENT_SWEEP_INTERVAL_SECS", &secs)?);
        }
        if let Some(method) = var("SETTLEMENT_METHOD") {
            config.settlement_method = method.parse()?;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if let Some(url) = &self.database_url {
            if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
                return Err(LedgerError::Configuration(
                    "DATABASE_URL must be a postgres:// URL".to_string(),
                ));
            }
            if self.max_db_connections == 0 {
                return Err(LedgerError::Configuration(
                    "max_db_connections must be > 0".to_string(),
                ));
            }
        }

        if self.sweep_interval.is_zero() {
            return Err(LedgerError::Configuration(
                "sweep_interval must be > 0".to_string(),
            ));
        }

        let code = self.currency.code();
        if code.len() < 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(LedgerError::Configuration(format!(
                "invalid ledger currency {:?}",
                code
            )));
        }

        if self.log_level.trim().is_empty() {
            return Err(LedgerError::Configuration(
                "log_level must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T, LedgerError> {
    value
        .trim()
        .parse()
        .map_err(|_| LedgerError::Configuration(format!("{} must be a number, got {:?}", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<NodeConfig, LedgerError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.database_url.is_none());
        assert_eq!(config.currency, Currency::nvct());
        assert_eq!(config.settlement_method, SettlementMethod::Ach);
    }

    #[test]
    fn test_from_vars_reads_overrides() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://ledger@localhost/ledger"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
            ("LOG_FORMAT", "pretty"),
            ("LEDGER_CURRENCY", "usd"),
            ("SETTLEMENT_SWEEP_INTERVAL_SECS", "15"),
            ("SETTLEMENT_METHOD", "swift"),
            ("NODE_OPERATOR_ID", "6f1c2c1e-8a0e-4a53-9c1e-2f4b8f0d9a11"),
        ])
        .unwrap();

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://ledger@localhost/ledger")
        );
        assert_eq!(config.max_db_connections, 4);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.currency.code(), "USD");
        assert_eq!(config.sweep_interval, Duration::from_secs(15));
        assert_eq!(config.settlement_method, SettlementMethod::Swift);
        assert_eq!(
            config.operator_id.to_string(),
            "6f1c2c1e-8a0e-4a53-9c1e-2f4b8f0d9a11"
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_values_are_unset() {
        let config = from_pairs(&[("DATABASE_URL", ""), ("LOG_LEVEL", "  ")]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_malformed_values_are_errors() {
        assert!(from_pairs(&[("SETTLEMENT_SWEEP_INTERVAL_SECS", "soon")]).is_err());
        assert!(from_pairs(&[("SETTLEMENT_METHOD", "carrier-pigeon")]).is_err());
        assert!(from_pairs(&[("LOG_FORMAT", "xml")]).is_err());
        assert!(from_pairs(&[("NODE_OPERATOR_ID", "operator-1")]).is_err());
    }

    #[test]
    fn test_validation() {
        let mut config = NodeConfig::default();
        config.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.database_url = Some("mysql://localhost/ledger".to_string());
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.database_url = Some("postgresql://localhost/ledger".to_string());
        config.max_db_connections = 0;
        assert!(matches!(
            config.validate(),
            Err(LedgerError::Configuration(_))
        ));

        let mut config = NodeConfig::default();
        config.currency = Currency::new("us");
        assert!(config.validate().is_err());
    }
}
