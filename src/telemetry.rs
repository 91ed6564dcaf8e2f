//! Telemetry bootstrap: logging first, tracing SDK second.
//!
//! Logging comes up as soon as the instance slot is known so startup is
//! observable; the OTel tracer is installed later in the boot sequence,
//! after the backdoor endpoint (liveness probes must not emit spans) and
//! before processor binding (transports pick up the global tracer).

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::FmtSubscriber;

const ATTR_SERVICE_NAME: &str = "service.name";
const ATTR_SERVICE_NAMESPACE: &str = "service.namespace";
const LOG_FILE_NAME: &str = "serv.log";

/// Write logs to standard output instead of a file.
pub const LOG_DIR_CONSOLE: &str = "console";

/// Log destination and rotation hints from the command line.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Directory for log files; empty or `console` keeps stdout.
    pub dir: String,
    /// Maximum log file size in megabytes; rotation is performed by the
    /// operator's log rotation, the value is recorded for it.
    pub max_size_mb: u64,
    /// Maximum rotated files to retain; recorded for the operator.
    pub max_backups: u64,
    /// Minimum level, one of trace/debug/info/warn/error.
    pub level: String,
}

/// Handle keeping the telemetry SDK providers alive for process lifetime.
pub struct Telemetry {
    service_name: String,
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Telemetry {
    /// Install the process-wide `tracing` subscriber.
    ///
    /// `copy_name` is the per-instance name; file logs go to
    /// `<dir>/<copy_name>/serv.log`.
    pub fn init_logging(service_name: &str, copy_name: &str, opts: &LogOptions) -> Result<Self> {
        let level = if opts.level.is_empty() {
            Level::INFO
        } else {
            parse_log_level(&opts.level)?
        };

        let builder = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(true)
            .json();

        let init_result = if opts.dir.is_empty() || opts.dir == LOG_DIR_CONSOLE {
            builder.try_init()
        } else {
            let mut path = PathBuf::from(&opts.dir);
            path.push(copy_name);
            fs::create_dir_all(&path)?;
            path.push(LOG_FILE_NAME);
            let file = File::create(&path)?;
            builder
                .with_writer(BoxMakeWriter::new(Arc::new(file)))
                .try_init()
        };
        // A second instance in one process (tests) keeps the first
        // subscriber; everything else proceeds normally.
        if let Err(e) = init_result {
            info!(error = %e, "tracing subscriber already installed");
        }

        info!(
            service = service_name,
            copy = copy_name,
            dir = %opts.dir,
            max_size_mb = opts.max_size_mb,
            max_backups = opts.max_backups,
            "logging initialized"
        );

        Ok(Self {
            service_name: service_name.to_string(),
            tracer_provider: None,
            meter_provider: None,
        })
    }

    /// Install the global tracer and meter providers. Sampler and resource
    /// attributes come from the standard `OTEL_*` environment variables.
    pub fn init_tracer(&mut self) -> Result<()> {
        let sampler_name = std::env::var("OTEL_TRACES_SAMPLER")
            .unwrap_or_else(|_| "parentbased_always_on".to_string());
        let sampler_arg = std::env::var("OTEL_TRACES_SAMPLER_ARG").ok();
        let sampler = parse_sampler(&sampler_name, sampler_arg.as_deref())?;

        let resource = Resource::default().merge(&Resource::new(vec![
            KeyValue::new(ATTR_SERVICE_NAME, self.service_name.clone()),
            KeyValue::new(ATTR_SERVICE_NAMESPACE, "rookery"),
        ]));

        let tracer_provider = TracerProvider::builder()
            .with_config(
                trace::Config::default()
                    .with_sampler(sampler)
                    .with_resource(resource.clone()),
            )
            .build();
        let _ = global::set_tracer_provider(tracer_provider.clone());

        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        global::set_meter_provider(meter_provider.clone());
        global::set_text_map_propagator(TraceContextPropagator::new());

        info!(
            service = %self.service_name,
            traces_sampler = %sampler_name,
            "tracer initialized"
        );

        self.tracer_provider = Some(tracer_provider);
        self.meter_provider = Some(meter_provider);
        Ok(())
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some(meter) = self.meter_provider.take() {
            let _ = meter.shutdown();
        }
        if let Some(tracer) = self.tracer_provider.take() {
            let _ = tracer.shutdown();
        }
    }
}

fn parse_log_level(raw: &str) -> Result<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(Error::Config(format!(
            "invalid log level '{other}', expected one of [trace, debug, info, warn, error]"
        ))),
    }
}

fn parse_sampler(name: &str, arg: Option<&str>) -> Result<Sampler> {
    match name.trim().to_ascii_lowercase().as_str() {
        "always_on" => Ok(Sampler::AlwaysOn),
        "always_off" => Ok(Sampler::AlwaysOff),
        "traceidratio" => Ok(Sampler::TraceIdRatioBased(parse_ratio(arg)?)),
        "parentbased_always_on" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOn))),
        "parentbased_always_off" => Ok(Sampler::ParentBased(Box::new(Sampler::AlwaysOff))),
        "parentbased_traceidratio" => Ok(Sampler::ParentBased(Box::new(
            Sampler::TraceIdRatioBased(parse_ratio(arg)?),
        ))),
        other => Err(Error::Config(format!(
            "OTEL_TRACES_SAMPLER '{other}' is not supported"
        ))),
    }
}

fn parse_ratio(arg: Option<&str>) -> Result<f64> {
    let raw = arg.ok_or_else(|| {
        Error::Config("OTEL_TRACES_SAMPLER_ARG is required for ratio samplers".to_string())
    })?;
    let value = raw
        .trim()
        .parse::<f64>()
        .map_err(|e| Error::Config(format!("OTEL_TRACES_SAMPLER_ARG must be a float: {e}")))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::Config(format!(
            "OTEL_TRACES_SAMPLER_ARG must be in [0,1], got {value}"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_level_accepts_known_names() {
        assert_eq!(parse_log_level("INFO").unwrap(), Level::INFO);
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn parse_sampler_requires_ratio_arg() {
        let err = parse_sampler("traceidratio", None).unwrap_err();
        assert!(format!("{err}").contains("OTEL_TRACES_SAMPLER_ARG"));
        assert!(parse_sampler("traceidratio", Some("0.5")).is_ok());
        assert!(parse_sampler("traceidratio", Some("1.5")).is_err());
    }
}
