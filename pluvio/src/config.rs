//! This module controls configuration parsing from the end user, providing
//! a convenience mechanism for the rest of the program. Startup failures
//! are most likely to originate here, intentionally: a station with a
//! misconfigured schema or boundary must not begin acquiring.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::gpio;
use crate::reconcile::{self, ResetBoundary};

/// Errors produced by [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading the config file.
    #[error("failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The configured reset boundary is not a valid time of day.
    #[error(transparent)]
    Boundary(#[from] reconcile::Error),
    /// The per-tick measurement unit must be positive.
    #[error("millimeters_per_tick must be positive, got {0}")]
    NonPositiveUnit(f64),
    /// The reconciliation tolerance must be positive.
    #[error("tolerance must be positive, got {0}")]
    NonPositiveTolerance(f64),
    /// A configured field name is absent from the expected schema.
    #[error("{field} is not among the configured data sources")]
    FieldNotInSchema {
        /// The absent field.
        field: String,
    },
}

fn default_daemon_addr() -> String {
    "127.0.0.1:8888".to_string()
}

fn default_debounce_holdoff_micros() -> u32 {
    100_000
}

fn default_rrdtool_binary() -> PathBuf {
    PathBuf::from("rrdtool")
}

fn default_rate_field() -> String {
    "precip_rate".to_string()
}

fn default_total_field() -> String {
    "precip_acc".to_string()
}

fn default_tolerance() -> f64 {
    1e-4
}

/// Main configuration struct for this program.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The GPIO daemon connection and gauge pin.
    pub gpio: GpioConfig,
    /// The rain gauge's electrical and measurement characteristics.
    pub gauge: GaugeConfig,
    /// The daily accumulation reset boundary, UTC. Defaults to midnight.
    #[serde(default)]
    pub reset: ResetConfig,
    /// Acceptable disagreement between the stored total and the recomputed
    /// sum of the day's rates.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// The round-robin store.
    pub store: StoreConfig,
    /// The method by which to express telemetry.
    pub telemetry: Option<Telemetry>,
}

/// GPIO daemon settings.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GpioConfig {
    /// Address of the pigpio daemon.
    #[serde(default = "default_daemon_addr")]
    pub daemon_addr: String,
    /// Broadcom pin number the gauge's reed switch is wired to.
    pub pin: u8,
    /// The transition that counts as a tick.
    #[serde(default)]
    pub edge: gpio::Edge,
}

/// Rain gauge settings.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GaugeConfig {
    /// Minimum gap between accepted edges, microseconds.
    #[serde(default = "default_debounce_holdoff_micros")]
    pub debounce_holdoff_micros: u32,
    /// Rainfall represented by one bucket tip.
    pub millimeters_per_tick: f64,
}

/// The daily reset boundary as a UTC time of day.
#[derive(Debug, Default, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct ResetConfig {
    /// Hour, 0-23.
    #[serde(default)]
    pub hour: u32,
    /// Minute, 0-59.
    #[serde(default)]
    pub minute: u32,
    /// Second, 0-59.
    #[serde(default)]
    pub second: u32,
    /// Microsecond, 0-999999.
    #[serde(default)]
    pub microsecond: u32,
}

/// Round-robin store settings.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// The round-robin database file.
    pub rrd_file: PathBuf,
    /// The rrdtool client binary.
    #[serde(default = "default_rrdtool_binary")]
    pub rrdtool_binary: PathBuf,
    /// Field the per-cycle precipitation rate is written to.
    #[serde(default = "default_rate_field")]
    pub rate_field: String,
    /// Field the daily accumulated total is written to.
    #[serde(default = "default_total_field")]
    pub total_field: String,
    /// Every data source the store file is expected to define. Checked
    /// against the file at startup; a mismatch is fatal.
    pub data_sources: Vec<String>,
    /// Ceiling on each store invocation, seconds. Absent means wait
    /// indefinitely, which is the default.
    pub timeout_secs: Option<u64>,
}

/// Telemetry settings.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct Telemetry {
    /// Address to expose Prometheus metrics on.
    pub prometheus_addr: SocketAddr,
}

impl Config {
    /// Read and validate configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Function will return an error if the file cannot be read, parsed or
    /// validated.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from YAML text.
    ///
    /// # Errors
    ///
    /// Function will return an error if the text cannot be parsed or
    /// validated.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// The configured reset boundary.
    ///
    /// # Errors
    ///
    /// Function will return an error if the configured fields do not name a
    /// valid time of day.
    pub fn reset_boundary(&self) -> Result<ResetBoundary, reconcile::Error> {
        ResetBoundary::new(
            self.reset.hour,
            self.reset.minute,
            self.reset.second,
            self.reset.microsecond,
        )
    }

    fn validate(&self) -> Result<(), Error> {
        self.reset_boundary()?;
        if self.gauge.millimeters_per_tick <= 0.0 {
            return Err(Error::NonPositiveUnit(self.gauge.millimeters_per_tick));
        }
        if self.tolerance <= 0.0 {
            return Err(Error::NonPositiveTolerance(self.tolerance));
        }
        for field in [&self.store.rate_field, &self.store.total_field] {
            if !self.store.data_sources.contains(field) {
                return Err(Error::FieldNotInSchema {
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    const MINIMAL: &str = r#"
gpio:
  pin: 27
gauge:
  millimeters_per_tick: 1.5
store:
  rrd_file: /var/lib/pluvio/weather.rrd
  data_sources: [precip_rate, precip_acc]
telemetry: null
"#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.gpio.daemon_addr, "127.0.0.1:8888");
        assert_eq!(config.gauge.debounce_holdoff_micros, 100_000);
        assert_eq!(config.store.rate_field, "precip_rate");
        assert_eq!(config.store.total_field, "precip_acc");
        assert_eq!(config.reset.hour, 0);
        assert!(config.store.timeout_secs.is_none());
        assert!((config.tolerance - 1e-4).abs() < f64::EPSILON);
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, MINIMAL.as_bytes()).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.gpio.pin, 27);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let contents = format!("{MINIMAL}\nthingspeak: true\n");
        assert!(Config::from_yaml(&contents).is_err());
    }

    #[test]
    fn boundary_is_validated() {
        let contents = format!("{MINIMAL}\nreset:\n  hour: 24\n");
        assert!(Config::from_yaml(&contents).is_err());
    }

    #[test]
    fn fields_must_be_in_schema() {
        let contents = MINIMAL.replace("[precip_rate, precip_acc]", "[precip_rate]");
        assert!(Config::from_yaml(&contents).is_err());
    }

    #[test]
    fn zero_unit_is_rejected() {
        let contents = MINIMAL.replace("millimeters_per_tick: 1.5", "millimeters_per_tick: 0.0");
        assert!(Config::from_yaml(&contents).is_err());
    }

    #[test]
    fn full_config_parses() {
        let contents = r#"
gpio:
  daemon_addr: "rainpi:8888"
  pin: 17
  edge: rising
gauge:
  debounce_holdoff_micros: 250000
  millimeters_per_tick: 0.2794
reset:
  hour: 9
tolerance: 0.001
store:
  rrd_file: /var/lib/pluvio/weather.rrd
  rrdtool_binary: /usr/bin/rrdtool
  rate_field: rain_rate
  total_field: rain_day
  data_sources: [rain_rate, rain_day, outside_temp]
  timeout_secs: 5
telemetry:
  prometheus_addr: "0.0.0.0:9598"
"#;
        let config = Config::from_yaml(contents).unwrap();
        assert_eq!(config.gpio.pin, 17);
        assert_eq!(config.store.timeout_secs, Some(5));
        assert!(config.telemetry.is_some());
    }
}
