use std::{convert::Infallible, fmt::Display, path::PathBuf, time::Duration};

use crate::graph::{NodeId, OpKind};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("node '{label}' of kind {kind} takes {expected} input(s) but was given {actual}")]
    ArityMismatch {
        kind: OpKind,
        label: String,
        expected: usize,
        actual: usize,
    },

    #[error("tensor '{label}' [{id}] belongs to a different graph")]
    ForeignTensor { id: NodeId, label: String },

    #[error("{what} was requested before the graph was planned (call `Graph::compile` first)")]
    UnplannedQuery { what: String },

    #[error("node [{id}] is not known to this graph")]
    UnknownNode { id: NodeId },

    #[error("compiler `{compiler}` failed to build {}: {stderr}", .source_path.display())]
    BuildFailure {
        compiler: String,
        source_path: PathBuf,
        stderr: String,
    },

    #[error("compiler `{compiler}` did not finish building {} within {timeout:?}", .source_path.display())]
    BuildTimeout {
        compiler: String,
        source_path: PathBuf,
        timeout: Duration,
    },

    #[error("failed to load kernel module {}: {reason}", .path.display())]
    LoadFailure { path: PathBuf, reason: String },

    #[error("symbol `{symbol}` not found in {}: {reason}", .path.display())]
    SymbolResolutionFailure {
        symbol: String,
        path: PathBuf,
        reason: String,
    },

    #[error("input '{label}' [{id}] has no planned slot to bind a value to")]
    UnboundInput { id: NodeId, label: String },

    #[error("{rows} rows do not fit in a slot of width {slot_width}")]
    ArenaOverflow { rows: usize, slot_width: usize },

    #[error("{0}")]
    Msg(String),

    #[error("{inner}\n{backtrace}")]
    WithBacktrace {
        inner: Box<Self>,
        backtrace: Box<std::backtrace::Backtrace>,
    },

    #[error("IO error: {0}")]
    IoError(String),

    /// An underlying error plus what we were doing when it happened.
    #[error("{context}: {wrapped}")]
    WrappedContext {
        wrapped: Box<dyn std::error::Error + Send + Sync>,
        context: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new error based on a printable error message.
    pub fn msg<M: Display>(msg: M) -> Self {
        Self::Msg(msg.to_string()).bt()
    }

    /// Attach a backtrace if `RUST_BACKTRACE` asks for one.
    pub fn bt(self) -> Self {
        let backtrace = std::backtrace::Backtrace::capture();
        match backtrace.status() {
            std::backtrace::BacktraceStatus::Disabled
            | std::backtrace::BacktraceStatus::Unsupported => self,
            _ => Self::WithBacktrace {
                inner: Box::new(self),
                backtrace: Box::new(backtrace),
            },
        }
    }

    /// The error with any backtrace wrapper peeled off.
    pub fn inner(&self) -> &Self {
        match self {
            Self::WithBacktrace { inner, .. } => inner.inner(),
            other => other,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::IoError(value.to_string())
    }
}

#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::Error::msg(format!($msg)))
    };
    ($err:expr $(,)?) => {
        return Err($crate::Error::msg($err))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::Error::msg(format!($fmt, $($arg)*)))
    };
}

pub(crate) mod private {
    pub trait Sealed {}

    impl<T, E> Sealed for std::result::Result<T, E> where E: std::error::Error {}
    impl<T> Sealed for Option<T> {}
}

/// Attach context to a failed `Result` or an empty `Option`.
pub trait Context<T, E>: private::Sealed {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static;

    /// Like [`Context::context`], building the message only on failure.
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
    {
        self.with_context(|| context)
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|err| {
            Error::WrappedContext {
                wrapped: Box::new(err),
                context: f().to_string(),
            }
            .bt()
        })
    }
}

impl<T> Context<T, Infallible> for Option<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
    {
        self.ok_or_else(|| Error::msg(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::msg(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_the_cause() {
        let io: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let err = io.context("reading kernel").unwrap_err();
        assert_eq!(err.inner().to_string(), "reading kernel: gone");
    }

    #[test]
    fn bail_formats_messages() {
        fn fails(n: usize) -> Result<()> {
            bail!("{n} is too many")
        }
        let err = fails(3).unwrap_err();
        assert!(matches!(err.inner(), Error::Msg(msg) if msg == "3 is too many"));
        assert_eq!(None::<u8>.context("empty").unwrap_err().inner().to_string(), "empty");
    }
}
