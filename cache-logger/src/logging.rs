use serde::Deserialize;
use std::{fs::File, io, sync::Arc};
use tracing::Subscriber;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{self, writer::BoxMakeWriter},
    layer::Layered,
    prelude::*,
    Layer, Registry,
};

type Filtered = Layered<EnvFilter, Registry>;

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("log output is 'file' but 'file-path' is not specified")]
    MissingFilePath,

    #[error("failed to open log file '{path}': {source}")]
    OpenFile {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    Json,
    #[default]
    Plain,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogOutput {
    #[default]
    Stdout,
    File,
}

/// Logging configuration.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogConfig {
    /// Log level, e.g., "info", "debug", "trace". `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Path to the log file, required if output is "file".
    pub file_path: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
            output: LogOutput::Stdout,
            file_path: None,
        }
    }
}

impl LogConfig {
    /// The configured level, falling back to `INFO` when it does not parse.
    pub fn level_filter(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::INFO)
    }

    fn writer(&self) -> Result<BoxMakeWriter, LoggerError> {
        match self.output {
            LogOutput::Stdout => Ok(BoxMakeWriter::new(io::stdout)),
            LogOutput::File => {
                let path = self
                    .file_path
                    .as_deref()
                    .ok_or(LoggerError::MissingFilePath)?;
                let file = File::create(path).map_err(|source| LoggerError::OpenFile {
                    path: path.to_string(),
                    source,
                })?;
                Ok(BoxMakeWriter::new(Arc::new(file)))
            }
        }
    }
}

/// Builds the subscriber described by `config` without installing it.
pub fn subscriber(config: &LogConfig) -> Result<impl Subscriber + Send + Sync, LoggerError> {
    let filter = EnvFilter::builder()
        .with_default_directive(config.level_filter().into())
        .from_env_lossy();
    let writer = config.writer()?;
    let to_file = config.output == LogOutput::File;

    let layer: Box<dyn Layer<Filtered> + Send + Sync> = match config.format {
        LogFormat::Json => fmt::layer().with_writer(writer).json().boxed(),
        LogFormat::Plain => fmt::layer()
            .with_writer(writer)
            .with_ansi(!to_file)
            .pretty()
            .boxed(),
    };

    Ok(Registry::default().with(filter).with(layer))
}

/// Installs the subscriber described by `config` as the global default.
pub fn init(config: &LogConfig) -> Result<(), LoggerError> {
    tracing::subscriber::set_global_default(subscriber(config)?)
        .map_err(|_| LoggerError::AlreadyInitialized)
}
