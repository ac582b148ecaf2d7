// 10.0 config.rs: all settings in one place. fees, pipeline timing, monitor
// cadence. 10.1 Environment has the dev/prod presets.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/** fee settings. both legs default to 1% of notional */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    // Charged on notional when opening
    pub open_rate: Decimal,
    // Taken out of the exit price when closing
    pub close_rate: Decimal,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            open_rate: dec!(0.01),
            close_rate: dec!(0.01),
        }
    }
}

// Timing for the ingestion side: normalizer reconnects and persister flushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    // Wall-clock interval between persister flush passes
    pub flush_interval_ms: u64,
    // Fixed delay between connection attempts
    pub reconnect_backoff_ms: u64,
    // Live trade ticks go out on "<prefix>:<ASSET>"
    pub trade_channel_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 20_000,
            reconnect_backoff_ms: 5_000,
            trade_channel_prefix: "trades".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn trade_channel(&self, asset: &crate::types::Symbol) -> String {
        format!("{}:{}", self.trade_channel_prefix, asset)
    }
}

// Liquidation monitor cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    // Interval between sweeps of the working set
    pub sweep_interval_ms: u64,
    // Run a full ledger reconciliation every N sweeps
    pub reconcile_every: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 10_000,
            reconcile_every: 6,
        }
    }
}

impl MonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// The complete core configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    pub fees: FeeConfig,
    pub pipeline: PipelineConfig,
    pub monitor: MonitorConfig,
}

impl CoreConfig {
    // Tight intervals for local runs and the sim
    pub fn development() -> Self {
        Self {
            fees: FeeConfig::default(),
            pipeline: PipelineConfig {
                flush_interval_ms: 500,
                reconnect_backoff_ms: 100,
                ..PipelineConfig::default()
            },
            monitor: MonitorConfig {
                sweep_interval_ms: 200,
                reconcile_every: 3,
            },
        }
    }

    // Validate for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, rate) in [
            ("open fee", self.fees.open_rate),
            ("close fee", self.fees.close_rate),
        ] {
            if rate < Decimal::ZERO || rate >= Decimal::ONE {
                return Err(ConfigError::InvalidFees {
                    reason: format!("{name} rate must be in [0, 1)"),
                });
            }
        }

        if self.pipeline.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidPipeline {
                reason: "flush interval must be positive".to_string(),
            });
        }

        if self.monitor.sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidMonitor {
                reason: "sweep interval must be positive".to_string(),
            });
        }

        if self.monitor.reconcile_every == 0 {
            return Err(ConfigError::InvalidMonitor {
                reason: "reconcile cadence must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidFees { reason: String },
    InvalidPipeline { reason: String },
    InvalidMonitor { reason: String },
}

// 10.1: environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn config(&self) -> CoreConfig {
        match self {
            Environment::Development => CoreConfig::development(),
            Environment::Production => CoreConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Symbol;

    #[test]
    fn default_config_valid() {
        assert!(CoreConfig::default().validate().is_ok());
        assert!(CoreConfig::development().validate().is_ok());
    }

    #[test]
    fn default_fee_is_one_percent() {
        let config = CoreConfig::default();
        assert_eq!(config.fees.open_rate, dec!(0.01));
        assert_eq!(config.fees.close_rate, dec!(0.01));
    }

    #[test]
    fn invalid_fee_rejected() {
        let mut config = CoreConfig::default();
        config.fees.open_rate = dec!(1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFees { .. })
        ));
    }

    #[test]
    fn zero_intervals_rejected() {
        let mut config = CoreConfig::default();
        config.pipeline.flush_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPipeline { .. })
        ));

        let mut config = CoreConfig::default();
        config.monitor.sweep_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMonitor { .. })
        ));
    }

    #[test]
    fn trade_channel_name() {
        let config = PipelineConfig::default();
        assert_eq!(
            config.trade_channel(&Symbol::new("btcusdt")),
            "trades:BTCUSDT"
        );
    }

    #[test]
    fn environment_presets() {
        assert!(Environment::Development.config().validate().is_ok());
        assert!(Environment::Production.config().validate().is_ok());
        assert_eq!(
            Environment::Production.config().pipeline.flush_interval_ms,
            20_000
        );
    }
}
