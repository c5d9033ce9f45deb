use anyhow::{anyhow, bail};
use config::Config;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Actix worker count, defaults to the number of physical cores when unset
    #[serde(default)]
    #[builder(default)]
    pub workers: Option<usize>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct ProfilerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sampling frequency in Hz
    #[serde(default = "default_frequency")]
    pub frequency: i32,
    /// How often the sampling window is rotated and written out
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,
    /// How often samples are cut from the sampler and attributed to the
    /// span bound at that time. Sets how precisely back to back spans on
    /// one thread are told apart
    #[serde(default = "default_slice_interval", with = "humantime_serde")]
    pub slice_interval: Duration,
    /// Where periodic flamegraphs are written, none disables writing
    #[serde(default)]
    #[builder(default)]
    pub output_dir: Option<PathBuf>,
    /// Libraries whose frames are never unwound by the sampler
    #[serde(default = "default_blocklist")]
    pub blocklist: Vec<String>,
}

fn default_frequency() -> i32 {
    100
}

fn default_report_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_slice_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_blocklist() -> Vec<String> {
    ["libc", "libgcc", "pthread", "vdso"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency: default_frequency(),
            report_interval: default_report_interval(),
            slice_interval: default_slice_interval(),
            output_dir: None,
            blocklist: default_blocklist(),
        }
    }
}

impl ProfilerConfig {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.enabled {
            return Ok(());
        }

        if !(1..=1000).contains(&self.frequency) {
            bail!(
                "profiler frequency must be between 1 and 1000 Hz, got {}",
                self.frequency
            );
        }

        if self.report_interval.is_zero() {
            bail!("profiler report_interval must be greater than zero");
        }

        if self.slice_interval.is_zero() || self.slice_interval > self.report_interval {
            bail!(
                "profiler slice_interval must be between zero and report_interval, got {:?}",
                self.slice_interval
            );
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct WorkloadConfig {
    /// Prefix of the per request service names, e.g. `spanprof-3`
    #[serde(default = "default_service_prefix")]
    pub service_prefix: String,
    #[serde(default = "default_fibonacci_n")]
    pub fibonacci_n: u32,
    /// Target of the outbound request branch, skipped when unset
    #[serde(default)]
    #[builder(default)]
    pub outbound_url: Option<String>,
    #[serde(default = "default_outbound_repeats")]
    pub outbound_repeats: u32,
    /// How long a request waits for its fan-out branches before
    /// answering with whatever is done
    #[serde(default = "default_join_timeout", with = "humantime_serde")]
    pub join_timeout: Duration,
}

fn default_service_prefix() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_fibonacci_n() -> u32 {
    32
}

fn default_outbound_repeats() -> u32 {
    10
}

fn default_join_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            service_prefix: default_service_prefix(),
            fibonacci_n: default_fibonacci_n(),
            outbound_url: None,
            outbound_repeats: default_outbound_repeats(),
            join_timeout: default_join_timeout(),
        }
    }
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.service_prefix.is_empty() {
            bail!("workload service_prefix must not be empty");
        }

        // fib(93) is the last one fitting a u64
        if self.fibonacci_n > 93 {
            bail!("workload fibonacci_n must be at most 93, got {}", self.fibonacci_n);
        }

        if let Some(target) = &self.outbound_url {
            let url = Url::parse(target)
                .map_err(|e| anyhow!("Invalid outbound_url '{}': {}", target, e))?;

            if !matches!(url.scheme(), "http" | "https") {
                bail!("outbound_url must be http or https, got '{}'", url.scheme());
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct DatasetConfig {
    /// A json array of movies, optionally gzipped (`.json.gz`)
    pub path: PathBuf,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/movies.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, Builder)]
pub struct SpanprofConfig {
    #[serde(default)]
    #[builder(default)]
    pub server: ServerConfig,
    #[serde(default)]
    #[builder(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    #[builder(default)]
    pub profiler: ProfilerConfig,
    #[serde(default)]
    #[builder(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    #[builder(default)]
    pub dataset: DatasetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OtelProto {
    Http,
    #[default]
    Grpc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileRotation {
    #[default]
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSink {
    #[serde(flatten)]
    pub dest: LogType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogType {
    Stdout {
        #[serde(default = "default_true")]
        color: bool,
        #[serde(default)]
        json: bool,
        #[serde(default)]
        spans: bool,
    },
    File {
        path: PathBuf,
        #[serde(default)]
        json: bool,
        #[serde(default)]
        rotation: FileRotation,
        #[serde(default)]
        max_files: usize,
        #[serde(default)]
        spans: bool,
    },
    Otel {
        #[serde(default)]
        endpoint: String,
        #[serde(default)]
        proto: OtelProto,
        /// Deployment environment reported as `service.env`
        #[serde(default = "default_env")]
        env: String,
        #[serde(default)]
        headers: std::collections::HashMap<String, String>,
    },
}

fn default_true() -> bool {
    true
}

fn default_env() -> String {
    "local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Fraction of fresh request traces which are exported
    #[serde(default = "default_span_sample_rate")]
    pub span_sample_rate: f32,
    #[serde(default = "default_sinks")]
    pub sinks: Vec<LogSink>,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_span_sample_rate() -> f32 {
    1.0
}

fn default_sinks() -> Vec<LogSink> {
    vec![LogSink {
        dest: LogType::Stdout {
            color: true,
            json: false,
            spans: false,
        },
    }]
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            span_sample_rate: default_span_sample_rate(),
            sinks: default_sinks(),
        }
    }
}

impl LoggingConfig {
    /// Deployment environment of the otlp sink, `local` without one
    pub fn env(&self) -> &str {
        self.sinks
            .iter()
            .find_map(|s| match &s.dest {
                LogType::Otel { env, .. } => Some(env.as_str()),
                _ => None,
            })
            .unwrap_or("local")
    }

    /// Validates the logging configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.sinks.is_empty() {
            bail!("At least one logging sink must be configured");
        }

        self.level.parse::<tracing::Level>().map_err(|_| {
            anyhow!(
                "Invalid log level: '{}'. Valid levels: trace, debug, info, warn, error",
                self.level
            )
        })?;

        if !(0.0..=1.0).contains(&self.span_sample_rate) {
            bail!(
                "span_sample_rate must be between 0.0 and 1.0, got {}",
                self.span_sample_rate
            );
        }

        let otel_sinks = self
            .sinks
            .iter()
            .filter(|s| matches!(s.dest, LogType::Otel { .. }))
            .count();
        if otel_sinks > 1 {
            bail!("Multiple OTLP sinks configured. Only one is currently supported.");
        }

        Ok(())
    }
}

impl SpanprofConfig {
    pub fn load(path: &PathBuf) -> Result<SpanprofConfig, anyhow::Error> {
        let cfg = Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .build()?;

        let cfg: SpanprofConfig = cfg.try_deserialize()?;
        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        self.logging.validate()?;
        self.profiler.validate()?;
        self.workload.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn parse(yaml: &str) -> SpanprofConfig {
        Config::builder()
            .add_source(config::File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg = parse("dataset:\n  path: movies.json.gz\n");

        assert_eq!(cfg.dataset.path, PathBuf::from("movies.json.gz"));
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.logging.span_sample_rate, 1.0);
        assert_eq!(cfg.profiler.frequency, 100);
        assert_eq!(cfg.profiler.report_interval, Duration::from_secs(60));
        assert_eq!(cfg.profiler.slice_interval, Duration::from_millis(100));
        assert_eq!(cfg.logging.env(), "local");
        assert_eq!(cfg.workload.outbound_repeats, 10);
        assert_eq!(cfg.workload.join_timeout, Duration::from_secs(30));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let cfg = parse(
            r#"
server:
  host: 127.0.0.1
  port: 8080
  workers: 2
logging:
  level: debug
  span_sample_rate: 0.25
  sinks:
    - type: stdout
      json: true
    - type: otel
      endpoint: http://localhost:4318/v1/traces
      proto: http
      env: staging
profiler:
  frequency: 250
  report_interval: 15s
  slice_interval: 50ms
  output_dir: /tmp/profiles
workload:
  service_prefix: demo
  fibonacci_n: 30
  outbound_url: https://example.com/
  join_timeout: 500ms
dataset:
  path: data/movies.json
"#,
        );

        assert_eq!(cfg.server.workers, Some(2));
        assert_eq!(cfg.logging.sinks.len(), 2);
        assert!(matches!(
            &cfg.logging.sinks[1].dest,
            LogType::Otel { proto: OtelProto::Http, env, .. } if env == "staging"
        ));
        assert_eq!(cfg.logging.env(), "staging");
        assert_eq!(cfg.profiler.report_interval, Duration::from_secs(15));
        assert_eq!(cfg.profiler.slice_interval, Duration::from_millis(50));
        assert_eq!(cfg.profiler.output_dir, Some(PathBuf::from("/tmp/profiles")));
        assert_eq!(cfg.workload.join_timeout, Duration::from_millis(500));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut cfg = SpanprofConfig::default();
        cfg.logging.span_sample_rate = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = SpanprofConfig::default();
        cfg.logging.level = "loud".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = SpanprofConfig::default();
        cfg.workload.outbound_url = Some("not a url".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = SpanprofConfig::default();
        cfg.workload.outbound_url = Some("ftp://example.com".to_string());
        assert!(cfg.validate().is_err());

        let mut cfg = SpanprofConfig::default();
        cfg.profiler.frequency = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = SpanprofConfig::default();
        cfg.profiler.slice_interval = Duration::from_secs(120);
        assert!(cfg.validate().is_err());
        cfg.profiler.slice_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());

        // disabled profiler settings are not checked
        cfg.profiler.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let cfg = SpanprofConfigBuilder::default()
            .workload(
                WorkloadConfigBuilder::default()
                    .service_prefix("svc".to_string())
                    .fibonacci_n(10)
                    .outbound_repeats(2)
                    .join_timeout(Duration::from_secs(1))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();

        assert_eq!(cfg.workload.service_prefix, "svc");
        assert!(cfg.workload.outbound_url.is_none());
        assert_eq!(cfg.server.port, 5000);
    }
}
