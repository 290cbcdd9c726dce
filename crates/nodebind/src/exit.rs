use std::fmt;
use std::io;

use nodebind_promise::ExecutorError;
use nodebind_runtime::{BinderError, ConfigError, RuntimeError};
use nodebind_transport::TransportError;

// Exit codes follow sysexits-style conventions where one fits.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

fn io_code(kind: io::ErrorKind) -> i32 {
    match kind {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::AddrNotAvailable => TRANSPORT_ERROR,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    }
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    let code = match &err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_code(source.kind()),
        TransportError::InvalidUri { .. } | TransportError::UnsupportedScheme(_) => USAGE,
        TransportError::Shutdown => TRANSPORT_ERROR,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn config_error(context: &str, err: ConfigError) -> CliError {
    let code = match &err {
        ConfigError::Io { source, .. } => io_code(source.kind()),
        ConfigError::Parse(_) | ConfigError::Invalid(_) => DATA_INVALID,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn binder_error(context: &str, err: &BinderError) -> CliError {
    let code = match err {
        BinderError::Timeout(_) => TIMEOUT,
        BinderError::Connection(_) => TRANSPORT_ERROR,
        BinderError::Marshal(_) => DATA_INVALID,
        BinderError::InvalidUri { .. } => USAGE,
        BinderError::LocalDispatch(_) | BinderError::Remote { .. } | BinderError::Cancelled => {
            FAILURE
        }
    };
    let message = match err {
        BinderError::Remote {
            cause: Some(cause), ..
        } => format!("{context}: {err} ({cause})"),
        _ => format!("{context}: {err}"),
    };
    CliError::new(code, message)
}

pub fn runtime_error(context: &str, err: RuntimeError) -> CliError {
    match err {
        RuntimeError::Config(err) => config_error(context, err),
        RuntimeError::Transport(err) => transport_error(context, err),
        RuntimeError::InvalidNode(_) => CliError::new(USAGE, format!("{context}: {err}")),
        RuntimeError::Executor(ExecutorError::InvalidConfig(_)) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn binder_errors_map_to_stable_codes() {
        assert_eq!(
            binder_error("call", &BinderError::Timeout(Duration::from_secs(1))).code,
            TIMEOUT
        );
        assert_eq!(
            binder_error("call", &BinderError::Connection("refused".into())).code,
            TRANSPORT_ERROR
        );
        assert_eq!(
            binder_error("call", &BinderError::Marshal("bad".into())).code,
            DATA_INVALID
        );
    }

    #[test]
    fn remote_cause_is_included_in_message() {
        let err = BinderError::Remote {
            message: "binder transaction failure".into(),
            cause: Some("target not found".into()),
        };
        let cli = binder_error("call failed", &err);
        assert_eq!(cli.code, FAILURE);
        assert!(cli.message.contains("target not found"));
    }

    #[test]
    fn invalid_config_is_data_invalid() {
        let err = config_error("load", ConfigError::Invalid("duplicate node id 1".into()));
        assert_eq!(err.code, DATA_INVALID);
        assert_eq!(err.to_string(), "load: invalid config: duplicate node id 1");
    }
}
