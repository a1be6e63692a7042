//! Tracing setup.
//!
//! Grounded on the shape of the teacher's `Telemetry` builder in `src/telemetry.rs`
//! (`Telemetry::new().with_name().with_version().register()`), with the OpenTelemetry
//! OTLP exporter layers dropped: this gateway has no collector to export to and
//! pulling in `opentelemetry`/`tracing-opentelemetry` for a self-hosted single-process
//! service would be dead weight (noted as a dependency drop in `DESIGN.md`). What
//! remains is exactly what every example in the pack falls back on for local
//! observability: `tracing_subscriber`'s env-filtered `fmt` layer.

use tracing_subscriber::EnvFilter;

pub struct Telemetry {
    name: String,
    version: String,
    default_level: String,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            default_level: "info".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_default_level(mut self, level: impl Into<String>) -> Self {
        self.default_level = level.into();
        self
    }

    /// Initializes the global `tracing` subscriber. Call once at process startup.
    pub fn register(self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_level.clone()));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
        tracing::info!(service = %self.name, version = %self.version, "telemetry initialized");
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
