//! Logging and OpenTelemetry initialisation for the bridge.
//!
//! Call [`init_tracing`] once at process startup and hold the returned
//! [`TelemetryGuard`] until exit.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP collector base URL (e.g. `http://localhost:4318`). When set the OTLP HTTP exporter is activated. |
//! | `RUST_LOG` | Log filter; overrides the `[log]` settings. |
//! | `VLXBRIDGE_LOG_FORMAT=json` | Emit newline-delimited JSON logs. |
//!
//! # Example
//!
//! ```rust,no_run
//! use vlxbridge_runtime::telemetry::{LogSettings, init_tracing};
//!
//! // Hold the guard for the entire lifetime of the process.
//! let _guard = init_tracing("vlxmqttha", &LogSettings::default());
//! ```

use std::path::{Path, PathBuf};

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// The `[log]` section of the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    /// `debug` instead of `info` for the bridge itself.
    pub verbose: bool,
    /// `debug` for the gateway crate regardless of `verbose`.
    pub klf200: bool,
    /// Write to this file instead of stdout.
    pub logfile: Option<PathBuf>,
}

/// Filter directives for `settings`, used when `RUST_LOG` is unset.
pub fn filter_directives(settings: &LogSettings) -> String {
    let level = if settings.verbose { "debug" } else { "info" };
    let gateway_level = if settings.klf200 { "debug" } else { level };
    format!("{level},vlxbridge_hal={gateway_level},rumqttc=warn")
}

/// Initialise the global `tracing` subscriber with an optional OTLP exporter
/// and an optional log file.
///
/// When `OTEL_EXPORTER_OTLP_ENDPOINT` is set an OTLP/HTTP span exporter is
/// configured and all spans are forwarded to the collector.
///
/// The returned [`TelemetryGuard`] **must** be held for the lifetime of the
/// process; dropping it flushes buffered log lines and pending span batches.
pub fn init_tracing(service_name: &str, settings: &LogSettings) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(settings)));
    let use_json = std::env::var("VLXBRIDGE_LOG_FORMAT").as_deref() == Ok("json");

    let (writer, writer_guard) = match settings.logfile.as_ref().and_then(|path| file_appender(path)) {
        Some(appender) => tracing_appender::non_blocking(appender),
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    let provider = build_provider(service_name);
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("vlxbridge")));
    let json_layer = use_json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer.clone())
    });
    let text_layer = (!use_json).then(|| {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(settings.logfile.is_none())
            .with_writer(writer.clone())
    });

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(json_layer)
        .with(text_layer)
        .try_init()
    {
        eprintln!("[vlxbridge] tracing already initialised: {e}");
    }

    TelemetryGuard {
        provider,
        _writer: writer_guard,
    }
}

fn file_appender(path: &Path) -> Option<RollingFileAppender> {
    let file_name = path.file_name()?.to_str()?;
    let directory = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(directory)
        .map_err(|e| eprintln!("[vlxbridge] cannot open log file {}: {e}", path.display()))
        .ok()
}

/// RAII guard that flushes logs and shuts down the OTel
/// [`SdkTracerProvider`] on drop.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
    _writer: WorkerGuard,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("[vlxbridge] OpenTelemetry provider shutdown error: {e}");
            }
        }
    }
}

/// Build an [`SdkTracerProvider`] when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
///
/// Returns `None` when the env-var is absent or the exporter cannot be
/// initialised (the error is printed to stderr).
fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[vlxbridge] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // init_tracing runs before the Tokio runtime exists, so no
            // batch exporter.
            .with_simple_exporter(exporter)
            .build(),
    )
}
