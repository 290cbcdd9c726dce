//! stderr logging for the `nodebind` binary.
//!
//! `--log-level` applies to the nodebind crates; everything else stays at
//! `warn` or quieter. A valid `RUST_LOG` replaces both.

use clap::ValueEnum;
use tracing_subscriber::EnvFilter;

const NODEBIND_TARGETS: [&str; 5] = [
    "nodebind",
    "nodebind_promise",
    "nodebind_transport",
    "nodebind_frame",
    "nodebind_runtime",
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Debug and trace output spans several crates and the per-connection
    /// threads, so it carries targets and thread names.
    fn is_verbose(self) -> bool {
        matches!(self, LogLevel::Debug | LogLevel::Trace)
    }
}

fn directives(level: LogLevel) -> String {
    let others = match level {
        LogLevel::Error => "error",
        _ => "warn",
    };
    std::iter::once(others.to_string())
        .chain(
            NODEBIND_TARGETS
                .iter()
                .map(|target| format!("{target}={}", level.as_str())),
        )
        .collect::<Vec<_>>()
        .join(",")
}

pub fn init_logging(format: LogFormat, level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives(level)));
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(level.is_verbose())
        .with_thread_names(level.is_verbose());

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }
}
