use crate::app::config::{FileRotation, LogType, LoggingConfig, OtelProto};
use anyhow::{Context, Result, anyhow};
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tracing_subscriber::fmt::format::{FmtSpan, Writer};
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

type DynLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync + 'static>;

struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

fn span_events(spans: bool) -> FmtSpan {
    if spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

pub fn init(config: &LoggingConfig) -> Result<Option<SdkTracerProvider>> {
    config.validate()?;

    let crate_name = env!("CARGO_PKG_NAME");
    let filter = EnvFilter::from_default_env()
        .add_directive("error".parse()?)
        .add_directive(format!("{}={}", crate_name, config.level).parse()?);

    let mut layers: Vec<DynLayer> = Vec::new();
    let mut otel_provider: Option<SdkTracerProvider> = None;

    for sink in &config.sinks {
        match &sink.dest {
            LogType::Stdout { color, json, spans } => {
                let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());
                std::mem::forget(guard);

                if *json {
                    layers.push(
                        fmt::layer()
                            .json()
                            .with_writer(non_blocking)
                            .with_span_events(span_events(*spans))
                            .boxed(),
                    );
                } else {
                    layers.push(
                        fmt::layer()
                            .compact()
                            .with_timer(CompactTime)
                            .with_ansi(*color)
                            .with_writer(non_blocking)
                            .with_span_events(span_events(*spans))
                            .boxed(),
                    );
                }
            }
            LogType::File {
                path,
                json,
                rotation,
                max_files,
                spans,
            } => {
                let writer = create_file_writer(path, rotation, *max_files)?;

                if *json {
                    layers.push(
                        fmt::layer()
                            .json()
                            .with_writer(writer)
                            .with_span_events(span_events(*spans))
                            .boxed(),
                    );
                } else {
                    layers.push(
                        fmt::layer()
                            .compact()
                            .with_timer(CompactTime)
                            .with_ansi(false)
                            .with_writer(writer)
                            .with_span_events(span_events(*spans))
                            .boxed(),
                    );
                }
            }
            LogType::Otel {
                endpoint,
                proto,
                env,
                headers,
            } => {
                if otel_provider.is_some() {
                    return Err(anyhow!(
                        "Multiple OTLP sinks configured. Only one is currently supported."
                    ));
                }

                let (otel_layer, provider) =
                    create_otel_layer(endpoint, proto, env, headers, config.span_sample_rate)?;
                layers.push(otel_layer);
                otel_provider = Some(provider);
            }
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    // inbound and outbound traceparent handling relies on w3c regardless
    // of whether anything is exported
    global::set_text_map_propagator(TraceContextPropagator::new());

    if let Some(ref provider) = otel_provider {
        global::set_tracer_provider(provider.clone());
    }

    Ok(otel_provider)
}

pub fn shutdown(provider: &SdkTracerProvider) -> Result<()> {
    provider
        .shutdown()
        .context("failed to shutdown tracer provider")
}

fn create_file_writer(
    path: &Path,
    rotation: &FileRotation,
    max_files: usize,
) -> Result<tracing_appender::non_blocking::NonBlocking> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("Invalid file name in path: {}", path.display()))?;

    let directory = path
        .parent()
        .ok_or_else(|| anyhow!("Invalid directory in path: {}", path.display()))?;

    if !directory.as_os_str().is_empty() {
        std::fs::create_dir_all(directory).with_context(|| {
            format!("failed to create log directory {}", directory.display())
        })?;
    }

    let file_appender = match rotation {
        FileRotation::Daily => tracing_appender::rolling::daily(directory, file_name),
        FileRotation::Hourly => tracing_appender::rolling::hourly(directory, file_name),
        FileRotation::Never => tracing_appender::rolling::never(directory, file_name),
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    cleanup_old_files(directory, file_name, max_files)?;

    std::mem::forget(guard);

    Ok(non_blocking)
}

fn cleanup_old_files(directory: &Path, prefix: &str, max_files: usize) -> Result<()> {
    if max_files == 0 {
        return Ok(());
    }

    let directory = if directory.as_os_str().is_empty() {
        Path::new(".")
    } else {
        directory
    };

    let mut files: Vec<_> = std::fs::read_dir(directory)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(prefix))
        })
        .filter_map(|entry| {
            entry
                .metadata()
                .ok()
                .and_then(|meta| meta.modified().ok().map(|time| (entry.path(), time)))
        })
        .collect();

    if files.len() <= max_files {
        return Ok(());
    }

    files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in files.iter().skip(max_files) {
        let _ = std::fs::remove_file(path);
    }

    Ok(())
}

static RUNTIME_ID: LazyLock<String> = LazyLock::new(|| uuid::Uuid::new_v4().to_string());

/// Random id of this process run, shared by exported spans and profiles
pub fn runtime_id() -> &'static str {
    &RUNTIME_ID
}

pub fn service_name() -> String {
    std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| env!("CARGO_PKG_NAME").to_string())
}

/// Resource describing this process, `runtime_id` distinguishes restarts
fn build_resource(env: &str) -> Resource {
    Resource::builder()
        .with_service_name(service_name())
        .with_attributes([
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            KeyValue::new("service.env", env.to_string()),
            KeyValue::new("runtime_id", runtime_id().to_string()),
        ])
        .build()
}

fn create_otel_layer(
    endpoint: &str,
    proto: &OtelProto,
    env: &str,
    headers: &HashMap<String, String>,
    sample_rate: f32,
) -> Result<(DynLayer, SdkTracerProvider)> {
    use opentelemetry_otlp::WithExportConfig;

    let exporter = match proto {
        OtelProto::Grpc => {
            use opentelemetry_otlp::WithTonicConfig;

            let mut builder = opentelemetry_otlp::SpanExporter::builder().with_tonic();
            if !endpoint.is_empty() {
                builder = builder.with_endpoint(endpoint);
            }
            if !headers.is_empty() {
                builder = builder.with_metadata(grpc_metadata(headers)?);
            }

            builder
                .build()
                .context("failed to build OTLP gRPC exporter")?
        }
        OtelProto::Http => build_http_exporter(endpoint, headers)?,
    };

    // request spans carry their own sampling decision, this only thins
    // out the lifecycle spans recorded through tracing
    let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(sample_rate as f64)));

    let tracer_provider = SdkTracerProvider::builder()
        .with_sampler(sampler)
        .with_resource(build_resource(env))
        .with_batch_exporter(exporter)
        .build();

    let tracer = tracer_provider.tracer(env!("CARGO_PKG_NAME"));
    let layer = tracing_opentelemetry::layer().with_tracer(tracer).boxed();

    Ok((layer, tracer_provider))
}

fn grpc_metadata(headers: &HashMap<String, String>) -> Result<MetadataMap> {
    let mut metadata = MetadataMap::with_capacity(headers.len());

    for (k, v) in headers {
        let key = MetadataKey::from_bytes(k.as_bytes())
            .with_context(|| format!("invalid otel header name '{}'", k))?;
        let value = MetadataValue::try_from(v.as_str())
            .with_context(|| format!("invalid otel header value for '{}'", k))?;
        metadata.insert(key, value);
    }

    Ok(metadata)
}

#[cfg(feature = "otel-http")]
fn build_http_exporter(
    endpoint: &str,
    headers: &HashMap<String, String>,
) -> Result<opentelemetry_otlp::SpanExporter> {
    use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};

    let mut builder = opentelemetry_otlp::SpanExporter::builder().with_http();
    if !endpoint.is_empty() {
        builder = builder.with_endpoint(endpoint);
    }
    if !headers.is_empty() {
        builder = builder.with_headers(headers.clone());
    }

    builder
        .build()
        .context("failed to build OTLP HTTP exporter")
}

#[cfg(not(feature = "otel-http"))]
fn build_http_exporter(
    _: &str,
    _: &HashMap<String, String>,
) -> Result<opentelemetry_otlp::SpanExporter> {
    Err(anyhow!(
        "OTLP HTTP exporter requested but the build does not enable the `otel-http` feature"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_attributes() {
        let resource = build_resource("test");

        let get = |key: &'static str| resource.get(&opentelemetry::Key::from_static_str(key));

        assert_eq!(get("service.env").map(|v| v.to_string()), Some("test".to_string()));
        assert_eq!(
            get("service.version").map(|v| v.to_string()),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
        assert_eq!(get("runtime_id").map(|v| v.to_string()), Some(runtime_id().to_string()));
    }

    #[test]
    fn test_grpc_metadata_rejects_bad_names() {
        let mut headers = HashMap::new();
        headers.insert("x-api-key".to_string(), "secret".to_string());
        assert_eq!(grpc_metadata(&headers).unwrap().len(), 1);

        headers.insert("bad header".to_string(), "v".to_string());
        assert!(grpc_metadata(&headers).is_err());
    }

    #[test]
    fn test_cleanup_keeps_newest_files() {
        let dir = std::env::temp_dir().join(format!("spanprof-logs-{}", fastrand::u64(..)));
        std::fs::create_dir_all(&dir).unwrap();

        for i in 0..4 {
            std::fs::write(dir.join(format!("app.log.{}", i)), "x").unwrap();
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        std::fs::write(dir.join("other.txt"), "x").unwrap();

        cleanup_old_files(&dir, "app.log", 2).unwrap();

        let mut left: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();

        assert_eq!(left, vec!["app.log.2", "app.log.3", "other.txt"]);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
