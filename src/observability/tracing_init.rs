//! Tracing initialization with configurable logging formats.
//!
//! Log output always goes to stderr so that machine-readable reports on
//! stdout stay clean.

use tracing_subscriber::{
    EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingConfig};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Initialize the global tracing subscriber.
///
/// Fails if a global subscriber has already been installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<(), TracingError> {
    let filter = build_env_filter(config);

    tracing_subscriber::registry()
        .with(build_fmt_layer(config))
        .with(filter)
        .try_init()
        .map_err(|e| TracingError::Init(e.to_string()))
}

fn build_fmt_layer(config: &LoggingConfig) -> BoxedLayer {
    let base = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(config.file_line)
        .with_line_number(config.file_line);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => base.pretty().with_target(true).boxed(),
        (LogFormat::Pretty, false) => base.pretty().with_target(true).without_time().boxed(),
        (LogFormat::Compact, true) => base.compact().with_target(true).boxed(),
        (LogFormat::Compact, false) => base.compact().with_target(true).without_time().boxed(),
        (LogFormat::Json, true) => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        (LogFormat::Json, false) => base
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .without_time()
            .boxed(),
    }
}

/// Build the filter: `RUST_LOG` wins, then the configured level plus directives.
pub(crate) fn build_env_filter(config: &LoggingConfig) -> EnvFilter {
    let base_level = config.level.as_str();

    if let Ok(env_filter) = std::env::var("RUST_LOG") {
        EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new(base_level))
    } else if let Some(filter) = &config.filter {
        let combined = format!("{},{}", base_level, filter);
        EnvFilter::try_new(combined).unwrap_or_else(|_| EnvFilter::new(base_level))
    } else {
        // The AWS SDK is chatty at debug
        EnvFilter::new(format!(
            "{},aws_smithy_runtime=warn,aws_config=warn,hyper=warn",
            base_level
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
}
