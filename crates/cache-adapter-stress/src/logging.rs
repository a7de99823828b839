use std::env;

use cache_adapter::config::{LogFormat, Logging, Metrics};
use cache_adapter::metrics;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => "INFO",
        LevelFilter::DEBUG => {
            "INFO,\
             cache_adapter=DEBUG,\
             cache_adapter_stress=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             cache_adapter=TRACE,\
             cache_adapter_stress=TRACE"
        }
    }
}

/// Initializes logging for the stresstest.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in the
/// configuration.
pub fn init_logging(config: &Logging) {
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.level).to_string());

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true);

    let fmt_layer = match (config.format, console::user_attended()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            layer.compact().with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(rust_log)))
        .init();
}

/// Reports the adapter metrics to statsd, if configured.
pub fn init_metrics(config: &Metrics) -> anyhow::Result<()> {
    let Some(statsd) = config.statsd.as_deref() else {
        return Ok(());
    };

    let mut tags = config.custom_tags.clone();
    tags.entry("env".into()).or_insert_with(|| "stresstest".into());

    metrics::configure_statsd(&config.prefix, statsd, tags)
}
