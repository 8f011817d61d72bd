use std::env;
use std::ops::RangeInclusive;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{invalid_input_error, Error};
use crate::search::Strategy;

/// Allowed response windows, in seconds, for the default and for per-request
/// overrides alike.
pub const RESPONSE_TIMEOUT_SECS: RangeInclusive<i64> = 10..=120;

/// Tunables for dispatching. Defaults match what tenants get out of the box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Radius used when the caller does not ask for one.
    pub search_radius_km: f64,
    /// Upper bound a caller may widen the radius to on retry.
    pub max_search_radius_km: f64,
    pub max_drivers_to_notify: usize,
    pub driver_response_timeout_secs: i64,
    pub assignment_strategy: Strategy,
    pub sweep_interval_secs: u64,
    /// How long resolved requests are remembered for late replies.
    pub resolved_retention_secs: i64,
    pub notify_timeout_ms: u64,
    pub average_speed_kmh: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search_radius_km: 5.0,
            max_search_radius_km: 15.0,
            max_drivers_to_notify: 5,
            driver_response_timeout_secs: 30,
            assignment_strategy: Strategy::Nearest,
            sweep_interval_secs: 5,
            resolved_retention_secs: 600,
            notify_timeout_ms: 2000,
            average_speed_kmh: 30.0,
        }
    }
}

impl Config {
    /// Reads `DISPATCH_*` variables (after loading `.env`, if present) on top of
    /// the defaults.
    #[tracing::instrument(name = "Config::from_env")]
    pub fn from_env() -> Result<Self, Error> {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Some(value) = read_var("DISPATCH_SEARCH_RADIUS_KM")? {
            config.search_radius_km = value;
        }
        if let Some(value) = read_var("DISPATCH_MAX_SEARCH_RADIUS_KM")? {
            config.max_search_radius_km = value;
        }
        if let Some(value) = read_var("DISPATCH_MAX_DRIVERS_TO_NOTIFY")? {
            config.max_drivers_to_notify = value;
        }
        if let Some(value) = read_var("DISPATCH_DRIVER_RESPONSE_TIMEOUT_SECS")? {
            config.driver_response_timeout_secs = value;
        }
        if let Some(value) = read_var("DISPATCH_ASSIGNMENT_STRATEGY")? {
            config.assignment_strategy = value;
        }
        if let Some(value) = read_var("DISPATCH_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval_secs = value;
        }
        if let Some(value) = read_var("DISPATCH_RESOLVED_RETENTION_SECS")? {
            config.resolved_retention_secs = value;
        }
        if let Some(value) = read_var("DISPATCH_NOTIFY_TIMEOUT_MS")? {
            config.notify_timeout_ms = value;
        }
        if let Some(value) = read_var("DISPATCH_AVERAGE_SPEED_KMH")? {
            config.average_speed_kmh = value;
        }

        config.validate()?;

        tracing::info!(?config, "loaded dispatch configuration");

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !(1.0..=50.0).contains(&self.search_radius_km) {
            return Err(invalid_input_error("search_radius_km must be within [1, 50]"));
        }

        if !(5.0..=100.0).contains(&self.max_search_radius_km) {
            return Err(invalid_input_error(
                "max_search_radius_km must be within [5, 100]",
            ));
        }

        if self.max_search_radius_km < self.search_radius_km {
            return Err(invalid_input_error(
                "max_search_radius_km must not be below search_radius_km",
            ));
        }

        if !(1..=20).contains(&self.max_drivers_to_notify) {
            return Err(invalid_input_error(
                "max_drivers_to_notify must be within [1, 20]",
            ));
        }

        if !RESPONSE_TIMEOUT_SECS.contains(&self.driver_response_timeout_secs) {
            return Err(invalid_input_error(
                "driver_response_timeout_secs must be within [10, 120]",
            ));
        }

        if self.sweep_interval_secs == 0 {
            return Err(invalid_input_error("sweep_interval_secs must be positive"));
        }

        if self.resolved_retention_secs < 0 {
            return Err(invalid_input_error(
                "resolved_retention_secs must not be negative",
            ));
        }

        if self.average_speed_kmh <= 0.0 {
            return Err(invalid_input_error("average_speed_kmh must be positive"));
        }

        Ok(())
    }

    pub fn driver_response_timeout(&self) -> Duration {
        Duration::seconds(self.driver_response_timeout_secs)
    }

    pub fn resolved_retention(&self) -> Duration {
        Duration::seconds(self.resolved_retention_secs)
    }

    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn notify_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.notify_timeout_ms)
    }
}

fn read_var<T>(key: &str) -> Result<Option<T>, Error>
where
    T: FromStr,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| invalid_input_error(key)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[test]
fn defaults_are_valid() {
    assert!(Config::default().validate().is_ok());
    assert_eq!(Config::default().driver_response_timeout(), Duration::seconds(30));
}

#[test]
fn bounds_are_enforced() {
    let config = Config {
        max_drivers_to_notify: 0,
        ..Config::default()
    };
    assert!(config.validate().unwrap_err().is_invalid_input_error());

    let config = Config {
        search_radius_km: 20.0,
        max_search_radius_km: 10.0,
        ..Config::default()
    };
    assert!(config.validate().is_err());

    let config = Config {
        driver_response_timeout_secs: 5,
        ..Config::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn partial_json_falls_back_to_defaults() {
    let config: Config =
        serde_json::from_str(r#"{ "assignment_strategy": "balanced", "max_drivers_to_notify": 3 }"#)
            .unwrap();

    assert_eq!(config.assignment_strategy, Strategy::Balanced);
    assert_eq!(config.max_drivers_to_notify, 3);
    assert_eq!(config.search_radius_km, 5.0);
}
