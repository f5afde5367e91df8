//! Service settings: where files live, which executables to run, and how much load to accept.
//!
//! Settings start from the `Default` impls in this module, are overlaid by a YAML file
//! (`config.yaml` unless `-f`/`IMG3D_CONFIG` names another; a missing file is fine), and finally
//! by `IMG3D_*` environment variables. A double underscore descends into a section, so
//! `IMG3D_CONVERTER__TIMEOUT=15m` sets `converter.timeout`.
//!
//! Sections:
//!
//! - `host`, `port`
//! - `storage`: upload and output roots, plus the prefix artifact URLs are built from
//! - `converter`, `validator`: program, leading args, timeout, optional working directory
//! - `limits`: body size cap and conversion admission
//! - `cors`: allowed browser origins
//! - `enable_metrics`, `enable_otel_export`
//!
//! Running Blender headless instead of the default Python script:
//!
//! ```bash
//! IMG3D_CONVERTER__PROGRAM=blender
//! IMG3D_CONVERTER__ARGS='[--background, --python, scripts/convert_to_3d.py, --]'
//! IMG3D_CONVERTER__TIMEOUT=20m
//! IMG3D_LIMITS__MAX_CONCURRENT_CONVERSIONS=2
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use url::Url;

use crate::errors::Error;

/// Command line arguments. Everything else comes from the config file and environment.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// YAML settings file
    #[arg(short = 'f', long, env = "IMG3D_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Load and check the settings, then exit.
    #[arg(long)]
    pub validate: bool,
}

/// Top-level service settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Listen address
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Working directories and public URL prefixes
    pub storage: StorageConfig,
    /// External image-to-3D conversion executable
    pub converter: ExecutableConfig,
    /// External image validation executable
    pub validator: ExecutableConfig,
    /// Upload size and admission limits
    pub limits: LimitsConfig,
    /// Cross-origin settings for the browser front-end
    pub cors: CorsConfig,
    /// Serve Prometheus metrics at `/internal/metrics`
    pub enable_metrics: bool,
    /// Export spans over OTLP (endpoint taken from `OTEL_*` variables)
    pub enable_otel_export: bool,
}

/// Where uploads and artifacts live on disk, and how artifacts are addressed publicly.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Root for uploaded source images. Each job gets its own subdirectory.
    pub uploads_dir: PathBuf,
    /// Root for conversion artifacts and saved models. Served under `/api/files`.
    pub output_dir: PathBuf,
    /// URL prefix artifact links are built from. May be absolute when behind a proxy.
    pub public_files_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("temp/uploads"),
            output_dir: PathBuf::from("temp/output"),
            public_files_url: "/api/files".to_string(),
        }
    }
}

/// An external executable invoked once per request.
///
/// The process is run as `program [args...] [request-specific args...]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutableConfig {
    /// Program to execute, resolved through `PATH` when not absolute
    pub program: String,
    /// Leading arguments placed before the request-specific ones (e.g. the script path)
    #[serde(default)]
    pub args: Vec<String>,
    /// Hard deadline after which the process group is killed
    #[serde(with = "humantime_serde", default = "ExecutableConfig::default_timeout")]
    pub timeout: Duration,
    /// Working directory for the process (defaults to the server's)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl ExecutableConfig {
    fn default_timeout() -> Duration {
        Duration::from_secs(600)
    }

    fn python_script(script: &str, timeout: Duration) -> Self {
        Self {
            program: "python3".to_string(),
            args: vec![script.to_string()],
            timeout,
            working_dir: None,
        }
    }
}

/// Upload size and conversion admission limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Maximum request body size in bytes for upload endpoints
    pub max_upload_size: usize,
    /// Maximum simultaneously running external processes (0 = unlimited)
    pub max_concurrent_conversions: usize,
    /// How long a request may wait for a conversion slot before failing with 429
    #[serde(with = "humantime_serde")]
    pub max_conversion_wait: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_size: 20 * 1024 * 1024,
            max_concurrent_conversions: 0,
            max_conversion_wait: Duration::from_secs(30),
        }
    }
}

/// An allowed CORS origin.
#[derive(Debug, Clone, PartialEq)]
pub enum CorsOrigin {
    Wildcard,
    Url(Url),
}

impl Serialize for CorsOrigin {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CorsOrigin::Wildcard => serializer.serialize_str("*"),
            CorsOrigin::Url(url) => serializer.serialize_str(url.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for CorsOrigin {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == "*" {
            return Ok(CorsOrigin::Wildcard);
        }
        Url::parse(&raw).map(CorsOrigin::Url).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsConfig {
    pub allowed_origins: Vec<CorsOrigin>,
    /// Preflight cache duration in seconds
    pub max_age: Option<u64>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec![CorsOrigin::Wildcard],
            max_age: Some(3600),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            storage: StorageConfig::default(),
            converter: ExecutableConfig::python_script("scripts/convert_image.py", Duration::from_secs(600)),
            validator: ExecutableConfig::python_script("scripts/validate_image.py", Duration::from_secs(60)),
            limits: LimitsConfig::default(),
            cors: CorsConfig::default(),
            enable_metrics: false,
            enable_otel_export: false,
        }
    }
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        for (name, exe) in [("converter", &self.converter), ("validator", &self.validator)] {
            if exe.program.trim().is_empty() {
                return Err(Error::Internal {
                    operation: format!("Config validation: {name}.program cannot be empty"),
                });
            }
            if exe.timeout.is_zero() {
                return Err(Error::Internal {
                    operation: format!("Config validation: {name}.timeout must be greater than zero"),
                });
            }
        }

        if self.limits.max_upload_size == 0 {
            return Err(Error::Internal {
                operation: "Config validation: limits.max_upload_size must be greater than zero".to_string(),
            });
        }

        let prefix = &self.storage.public_files_url;
        if !(prefix.starts_with('/') || prefix.starts_with("http://") || prefix.starts_with("https://")) {
            return Err(Error::Internal {
                operation: format!("Config validation: storage.public_files_url ({prefix}) must be a path or an http(s) URL"),
            });
        }

        if self.storage.uploads_dir == self.storage.output_dir {
            return Err(Error::Internal {
                operation: "Config validation: storage.uploads_dir and storage.output_dir must differ".to_string(),
            });
        }

        if self.cors.allowed_origins.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: CORS allowed_origins cannot be empty. Add at least one allowed origin.".to_string(),
            });
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("IMG3D_").split("__").ignore(&["config"]))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
