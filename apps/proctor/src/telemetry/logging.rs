use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Targets the orchestrator logs under, plus the crate path for events
/// that keep their module target.
const PROCTOR_TARGETS: &[&str] = &[
    "signaling",
    "status",
    "pairing",
    "gate",
    "api",
    "proctor",
    "proctor_core",
];

/// Chatty dependencies held at `info` unless explicitly asked for.
const DEPENDENCY_TARGETS: &[&str] = &[
    "hyper",
    "hyper_util",
    "tokio_tungstenite",
    "tungstenite",
    "reqwest",
    "rustls",
    "mio",
    "h2",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(config.level))
        .with_level(true)
        .with_target(true)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(())
}

fn build_env_filter(level: LogLevel) -> EnvFilter {
    match std::env::var("PROCTOR_LOG_FILTER") {
        Ok(filter) if !filter.trim().is_empty() => EnvFilter::new(filter),
        _ => EnvFilter::new(default_filter_for(level)),
    }
}

fn default_filter_for(level: LogLevel) -> String {
    match level.to_filter() {
        LevelFilter::DEBUG | LevelFilter::TRACE => {
            let mut filter = String::from("info");
            for target in PROCTOR_TARGETS {
                filter.push_str(&format!(",{target}={}", level.as_str()));
            }
            if level == LogLevel::Trace {
                for target in DEPENDENCY_TARGETS {
                    filter.push_str(&format!(",{target}=info"));
                }
            }
            filter
        }
        _ => level.as_str().to_string(),
    }
}
