//! Structured logging plus an optional OTLP/gRPC span exporter.
//!
//! Spans are exported only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set. Without it the service
//! logs to stdout and never dials a collector.

use anyhow::{Result, anyhow};
use base64ct::{Base64, Encoding};
use once_cell::sync::OnceCell;
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry::{KeyValue, global, trace::TracerProvider as _};
use opentelemetry_otlp::{Compression, WithExportConfig, WithTonicConfig};
use opentelemetry_sdk::{
    Resource,
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace::{SdkTracerProvider, Tracer},
};
use std::{env::var, time::Duration};
use tonic::{
    metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue},
    transport::ClientTlsConfig,
};
use tracing::{Level, debug};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};
use ulid::Ulid;

use crate::cli::commands::logging::LogSettings;

const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");
const EXPORT_TIMEOUT: Duration = Duration::from_secs(3);

/// Dependencies that are noisy below these levels.
const QUIET_TARGETS: [&str; 6] = [
    "hyper=error",
    "h2=error",
    "tokio=error",
    "reqwest=warn",
    "sqlx=warn",
    "opentelemetry_sdk=warn",
];

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

/// OTLP exporter settings read from the standard `OTEL_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExporterSettings {
    endpoint: String,
    /// `(key, value)` pairs from `OTEL_EXPORTER_OTLP_HEADERS`, keys lowercased.
    headers: Vec<(String, String)>,
    service_name: String,
    instance_id: String,
}

impl ExporterSettings {
    /// `None` when no collector endpoint is configured.
    fn from_env() -> Option<Self> {
        let endpoint = var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .ok()
            .filter(|endpoint| !endpoint.trim().is_empty())?;
        if let Ok(protocol) = var("OTEL_EXPORTER_OTLP_PROTOCOL")
            && protocol != "grpc"
        {
            debug!("OTEL_EXPORTER_OTLP_PROTOCOL={protocol} ignored, exporting over gRPC");
        }
        Some(Self {
            endpoint: normalize_endpoint(endpoint.trim()),
            headers: var("OTEL_EXPORTER_OTLP_HEADERS")
                .map(|raw| parse_headers(&raw))
                .unwrap_or_default(),
            service_name: var("OTEL_SERVICE_NAME").unwrap_or_else(|_| SERVICE_NAME.to_string()),
            instance_id: var("OTEL_SERVICE_INSTANCE_ID")
                .unwrap_or_else(|_| Ulid::new().to_string()),
        })
    }

    /// Host to verify the collector certificate against, for `https` endpoints.
    fn tls_domain(&self) -> Option<&str> {
        self.endpoint
            .strip_prefix("https://")
            .and_then(|rest| rest.split(['/', ':']).next())
            .filter(|host| !host.is_empty())
    }

    fn metadata(&self) -> Result<MetadataMap> {
        let mut meta = MetadataMap::with_capacity(self.headers.len());
        for (key, value) in &self.headers {
            // gRPC binary metadata keys end in "-bin" and carry base64 values.
            if key.ends_with("-bin") {
                let bytes = Base64::decode_vec(value)
                    .map_err(|err| anyhow!("OTLP header {key} is not base64: {err}"))?;
                let key = MetadataKey::<Binary>::from_bytes(key.as_bytes())
                    .map_err(|err| anyhow!("invalid OTLP header name {key}: {err}"))?;
                meta.insert_bin(key, MetadataValue::from_bytes(&bytes));
            } else {
                let name = MetadataKey::<Ascii>::from_bytes(key.as_bytes())
                    .map_err(|err| anyhow!("invalid OTLP header name {key}: {err}"))?;
                let value: MetadataValue<Ascii> = value
                    .parse()
                    .map_err(|err| anyhow!("invalid OTLP header value for {key}: {err}"))?;
                meta.insert(name, value);
            }
        }
        Ok(meta)
    }
}

fn parse_headers(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim().to_ascii_lowercase();
            (!key.is_empty()).then(|| (key, value.trim().to_string()))
        })
        .collect()
}

fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint.trim_end_matches('/'))
    }
}

fn init_tracer(settings: &ExporterSettings) -> Result<Tracer> {
    let mut builder = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&settings.endpoint)
        .with_compression(Compression::Gzip)
        .with_timeout(EXPORT_TIMEOUT);
    if let Some(domain) = settings.tls_domain() {
        builder = builder.with_tls_config(
            ClientTlsConfig::new()
                .domain_name(domain.to_string())
                .with_native_roots(),
        );
    }
    if !settings.headers.is_empty() {
        builder = builder.with_metadata(settings.metadata()?);
    }

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(builder.build()?)
        .with_resource(
            Resource::builder_empty()
                .with_attributes(vec![
                    KeyValue::new("service.name", settings.service_name.clone()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    KeyValue::new("service.instance.id", settings.instance_id.clone()),
                ])
                .build(),
        )
        .build();

    let _ = TRACER_PROVIDER.set(provider.clone());
    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ]));

    Ok(provider.tracer(SERVICE_NAME))
}

fn env_filter(level: Level) -> Result<EnvFilter> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    for directive in QUIET_TARGETS {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber: pretty or JSON logs, plus OTLP spans when configured.
///
/// # Errors
///
/// Returns an error if the exporter or the subscriber cannot be initialized.
pub fn init(settings: LogSettings) -> Result<()> {
    let filter = env_filter(settings.level.unwrap_or(Level::ERROR))?;

    let pretty = (!settings.json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_file(false)
            .with_line_number(false)
            .pretty()
    });
    let json = settings.json.then(|| {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
    });
    let otel = ExporterSettings::from_env()
        .map(|exporter| init_tracer(&exporter))
        .transpose()?
        .map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));

    let subscriber = Registry::default()
        .with(pretty)
        .with(json)
        .with(otel)
        .with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Flush pending spans. Does nothing when no exporter was started.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        debug!("flushing tracer provider");
        if let Err(err) = provider.shutdown() {
            debug!("tracer provider shutdown failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OTEL_VARS: [&str; 5] = [
        "OTEL_EXPORTER_OTLP_ENDPOINT",
        "OTEL_EXPORTER_OTLP_PROTOCOL",
        "OTEL_EXPORTER_OTLP_HEADERS",
        "OTEL_SERVICE_NAME",
        "OTEL_SERVICE_INSTANCE_ID",
    ];

    fn with_otel_env(vars: &[(&str, &str)], test: impl FnOnce()) {
        let env: Vec<(&str, Option<&str>)> = OTEL_VARS
            .iter()
            .map(|&name| {
                let value = vars
                    .iter()
                    .find(|&&(set, _)| set == name)
                    .map(|&(_, value)| value);
                (name, value)
            })
            .collect();
        temp_env::with_vars(env, test);
    }

    #[test]
    fn exporter_is_off_without_endpoint() {
        with_otel_env(&[], || assert_eq!(ExporterSettings::from_env(), None));
        with_otel_env(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "  ")], || {
            assert_eq!(ExporterSettings::from_env(), None);
        });
    }

    #[test]
    fn exporter_defaults_to_service_name() {
        with_otel_env(
            &[
                ("OTEL_EXPORTER_OTLP_ENDPOINT", "collector.example.test:4317/"),
                ("OTEL_SERVICE_INSTANCE_ID", "pod-1"),
            ],
            || {
                let settings = ExporterSettings::from_env();
                assert_eq!(
                    settings,
                    Some(ExporterSettings {
                        endpoint: "https://collector.example.test:4317".to_string(),
                        headers: Vec::new(),
                        service_name: "universal-auth".to_string(),
                        instance_id: "pod-1".to_string(),
                    })
                );
                assert_eq!(
                    settings.as_ref().and_then(ExporterSettings::tls_domain),
                    Some("collector.example.test")
                );
            },
        );
    }

    #[test]
    fn plain_http_endpoint_skips_tls() {
        with_otel_env(
            &[
                ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4317"),
                ("OTEL_SERVICE_NAME", "universal-auth-canary"),
            ],
            || {
                let settings = ExporterSettings::from_env();
                assert_eq!(
                    settings.as_ref().map(|s| s.service_name.as_str()),
                    Some("universal-auth-canary")
                );
                assert_eq!(settings.as_ref().and_then(ExporterSettings::tls_domain), None);
            },
        );
    }

    #[test]
    fn headers_skip_malformed_pairs() {
        assert!(parse_headers("").is_empty());
        assert_eq!(
            parse_headers("Authorization = Bearer abc ,malformed, =x, trace-bin=AQI="),
            vec![
                ("authorization".to_string(), "Bearer abc".to_string()),
                ("trace-bin".to_string(), "AQI=".to_string()),
            ]
        );
    }

    #[test]
    fn headers_become_grpc_metadata() -> Result<()> {
        let settings = ExporterSettings {
            endpoint: "https://collector.example.test".to_string(),
            headers: parse_headers("authorization=Bearer abc,trace-bin=AQI="),
            service_name: SERVICE_NAME.to_string(),
            instance_id: "pod-1".to_string(),
        };
        let metadata = settings.metadata()?;
        assert_eq!(
            metadata.get("authorization").and_then(|v| v.to_str().ok()),
            Some("Bearer abc")
        );
        assert!(metadata.get_bin("trace-bin").is_some());

        let broken = ExporterSettings {
            headers: vec![("x-bin".to_string(), "%%%".to_string())],
            ..settings
        };
        assert!(broken.metadata().is_err());
        Ok(())
    }

    #[test]
    fn quiet_targets_parse() -> Result<()> {
        temp_env::with_var("RUST_LOG", None::<&str>, || env_filter(Level::INFO).map(|_| ()))
    }
}
