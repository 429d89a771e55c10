//! Runtime configuration, deserialised from `config.toml` and `ROSTER_*`
//! environment variables.
//!
//! ```toml
//! host       = "127.0.0.1"
//! port       = 8080
//! store_path = "~/.local/share/roster/roster.db"
//!
//! [registry]
//! base_url            = "https://sandbox.api.service.nhs.uk/personal-demographics/FHIR/R4"
//! timeout_secs        = 10
//! max_in_flight       = 5
//! requests_per_second = 5
//!
//! [retry]
//! min_delay_ms = 1000
//! max_delay_ms = 10000
//!
//! [search]
//! max_restarts = 2
//!
//! [imports]
//! min_match_rate = 0.7
//! ```
//!
//! Every key can be overridden from the environment. Top-level keys take a
//! single underscore after the prefix (`ROSTER_STORE_PATH`) and nested keys
//! a double underscore (`ROSTER_REGISTRY__BASE_URL`).

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use roster_core::{
  changeset::BatchPolicy,
  engine::RetryPolicy,
  pipeline::PipelineConfig,
};
use serde::Deserialize;

use crate::{registry::RegistryConfig, throttle::ThrottleConfig};

// ─── Server ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:       String,
  #[serde(default = "default_port")]
  pub port:       u16,
  pub store_path: PathBuf,
  /// Concurrent job handlers per queue.
  #[serde(default = "default_workers")]
  pub workers:    usize,
  #[serde(default)]
  pub registry:   RegistrySettings,
  #[serde(default)]
  pub retry:      RetrySettings,
  #[serde(default)]
  pub search:     SearchSettings,
  #[serde(default)]
  pub imports:    ImportSettings,
}

fn default_host() -> String { "127.0.0.1".to_owned() }

fn default_port() -> u16 { 8080 }

fn default_workers() -> usize { 4 }

impl ServerConfig {
  /// Layer the TOML file at `path` (optional) under `ROSTER_*` variables.
  pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
    Self::load_with(path, environment())
  }

  fn load_with(
    path: &Path,
    env: config::Environment,
  ) -> Result<Self, config::ConfigError> {
    config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(env)
      .build()?
      .try_deserialize()
  }

  pub fn pipeline_config(&self) -> PipelineConfig {
    PipelineConfig {
      retry:        self.retry.policy(),
      max_restarts: self.search.max_restarts,
      batch:        BatchPolicy { min_match_rate: self.imports.min_match_rate },
    }
  }
}

fn environment() -> config::Environment {
  config::Environment::with_prefix("ROSTER")
    .prefix_separator("_")
    .separator("__")
}

// ─── Sections ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
  pub base_url:            String,
  pub timeout_secs:        u64,
  pub max_in_flight:       usize,
  pub requests_per_second: u32,
}

impl Default for RegistrySettings {
  fn default() -> Self {
    let client = RegistryConfig::default();
    let throttle = ThrottleConfig::default();
    Self {
      base_url:            client.base_url,
      timeout_secs:        client.timeout.as_secs(),
      max_in_flight:       throttle.max_in_flight,
      requests_per_second: throttle.requests_per_second,
    }
  }
}

impl RegistrySettings {
  pub fn client(&self) -> RegistryConfig {
    RegistryConfig {
      base_url: self.base_url.clone(),
      timeout:  Duration::from_secs(self.timeout_secs),
    }
  }

  pub fn throttle(&self) -> ThrottleConfig {
    ThrottleConfig {
      max_in_flight:       self.max_in_flight,
      requests_per_second: self.requests_per_second,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
  pub min_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetrySettings {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      min_delay_ms: policy.min_delay.as_millis() as u64,
      max_delay_ms: policy.max_delay.as_millis() as u64,
    }
  }
}

impl RetrySettings {
  pub fn policy(&self) -> RetryPolicy {
    RetryPolicy {
      min_delay: Duration::from_millis(self.min_delay_ms),
      max_delay: Duration::from_millis(self.max_delay_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
  pub max_restarts: u32,
}

impl Default for SearchSettings {
  fn default() -> Self {
    Self { max_restarts: PipelineConfig::default().max_restarts }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportSettings {
  /// Unset disables the low match rate gate.
  pub min_match_rate: Option<f64>,
}

// ─── Paths ────────────────────────────────────────────────────────────────────

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(toml: &str) -> ServerConfig {
    config::Config::builder()
      .add_source(config::File::from_str(toml, config::FileFormat::Toml))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap()
  }

  #[test]
  fn minimal_file_takes_defaults() {
    let cfg = parse(r#"store_path = "roster.db""#);
    assert_eq!(cfg.port, 8080);
    assert_eq!(cfg.search.max_restarts, 2);
    assert_eq!(cfg.registry.max_in_flight, ThrottleConfig::default().max_in_flight);
    assert!(cfg.imports.min_match_rate.is_none());

    let pipeline = cfg.pipeline_config();
    assert_eq!(pipeline.retry, RetryPolicy::default());
    assert!(pipeline.batch.min_match_rate.is_none());
  }

  #[test]
  fn sections_override_defaults() {
    let cfg = parse(
      r#"
      store_path = "roster.db"
      port = 9000

      [registry]
      base_url = "http://localhost:9090/FHIR/R4"
      requests_per_second = 2

      [retry]
      min_delay_ms = 50
      max_delay_ms = 100

      [imports]
      min_match_rate = 0.75
      "#,
    );
    assert_eq!(cfg.port, 9000);
    assert_eq!(cfg.registry.client().base_url, "http://localhost:9090/FHIR/R4");
    assert_eq!(cfg.registry.throttle().requests_per_second, 2);
    assert_eq!(cfg.retry.policy().max_delay, Duration::from_millis(100));
    assert_eq!(cfg.pipeline_config().batch.min_match_rate, Some(0.75));
  }

  #[test]
  fn environment_alone_is_enough_to_start() {
    let vars = [
      ("ROSTER_STORE_PATH", "/tmp/roster.db"),
      ("ROSTER_PORT", "9999"),
      ("ROSTER_REGISTRY__BASE_URL", "http://registry.test/FHIR/R4"),
      ("ROSTER_IMPORTS__MIN_MATCH_RATE", "0.8"),
    ];
    let env = environment().source(Some(
      vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
    ));

    let cfg =
      ServerConfig::load_with(Path::new("/nonexistent/roster.toml"), env).unwrap();
    assert_eq!(cfg.store_path, PathBuf::from("/tmp/roster.db"));
    assert_eq!(cfg.port, 9999);
    assert_eq!(cfg.registry.base_url, "http://registry.test/FHIR/R4");
    assert_eq!(cfg.imports.min_match_rate, Some(0.8));
    assert_eq!(cfg.host, "127.0.0.1");
  }

  #[test]
  fn tilde_expands_to_home() {
    let Ok(home) = std::env::var("HOME") else { return };
    assert_eq!(
      expand_tilde(Path::new("~/roster.db")),
      PathBuf::from(home).join("roster.db")
    );
    assert_eq!(expand_tilde(Path::new("/tmp/roster.db")), PathBuf::from("/tmp/roster.db"));
  }
}
