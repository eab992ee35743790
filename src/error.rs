//! Error types for rdbc-pool
//!
//! A single tagged error with granular classification instead of an
//! exception hierarchy:
//! - Retriable kinds (connection-open, pool-exhausted)
//! - Non-retriable kinds (driver-setup, stale-connection, configuration)

use std::fmt;
use thiserror::Error;

/// Result type for rdbc-pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error cause attached to driver-originated failures
pub type Cause = Box<dyn std::error::Error + Send + Sync>;

/// Error kinds for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A driver could not be registered or instantiated
    DriverSetup,
    /// The driver refused to issue a physical connection (retriable)
    ConnectionOpen,
    /// The pool could not produce a valid connection (retriable with backoff)
    PoolExhausted,
    /// A method was invoked through a pooled handle that is no longer valid
    StaleConnection,
    /// The driver refused to negotiate auto-commit
    AutoCommitConfig,
    /// A driver call failed (execute, rollback, commit, close, ...)
    Driver,
    /// Transaction lifecycle error
    Transaction,
    /// DataSource or factory configuration error
    Configuration,
}

impl ErrorKind {
    /// Whether errors of this kind are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::ConnectionOpen | Self::PoolExhausted)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DriverSetup => write!(f, "driver_setup"),
            Self::ConnectionOpen => write!(f, "connection_open"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::StaleConnection => write!(f, "stale_connection"),
            Self::AutoCommitConfig => write!(f, "auto_commit_config"),
            Self::Driver => write!(f, "driver"),
            Self::Transaction => write!(f, "transaction"),
            Self::Configuration => write!(f, "configuration"),
        }
    }
}

/// Main error type for rdbc-pool
#[derive(Error, Debug)]
pub enum Error {
    /// Driver could not be loaded or instantiated
    #[error("error setting up driver: {message}")]
    DriverSetup {
        /// What went wrong
        message: String,
        /// Originating cause, if any
        #[source]
        source: Option<Cause>,
    },

    /// The driver refused to issue a physical connection
    #[error("error opening connection: {message}")]
    ConnectionOpen {
        /// What went wrong
        message: String,
        /// Originating driver cause, if any
        #[source]
        source: Option<Cause>,
    },

    /// The pool could not produce a valid connection
    #[error("pool exhausted: {message}")]
    PoolExhausted {
        /// What went wrong
        message: String,
    },

    /// A method was invoked through an invalidated pooled handle
    #[error("error accessing pooled connection: {message}")]
    StaleConnection {
        /// What went wrong
        message: String,
    },

    /// The driver refused to negotiate auto-commit
    #[error("error configuring auto-commit: {message}")]
    AutoCommitConfig {
        /// What went wrong
        message: String,
        /// Originating driver cause, if any
        #[source]
        source: Option<Cause>,
    },

    /// A driver call failed
    #[error("driver error: {message}")]
    Driver {
        /// What went wrong
        message: String,
        /// Originating driver cause, if any
        #[source]
        source: Option<Cause>,
    },

    /// Transaction lifecycle error
    #[error("transaction error: {message}")]
    Transaction {
        /// What went wrong
        message: String,
        /// Originating cause, if any
        #[source]
        source: Option<Cause>,
    },

    /// DataSource or factory configuration error
    #[error("configuration error: {message}")]
    Configuration {
        /// What went wrong
        message: String,
    },
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DriverSetup { .. } => ErrorKind::DriverSetup,
            Self::ConnectionOpen { .. } => ErrorKind::ConnectionOpen,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::StaleConnection { .. } => ErrorKind::StaleConnection,
            Self::AutoCommitConfig { .. } => ErrorKind::AutoCommitConfig,
            Self::Driver { .. } => ErrorKind::Driver,
            Self::Transaction { .. } => ErrorKind::Transaction,
            Self::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }

    /// Create a driver-setup error
    pub fn driver_setup(message: impl Into<String>) -> Self {
        Self::DriverSetup {
            message: message.into(),
            source: None,
        }
    }

    /// Create a driver-setup error with its originating cause
    pub fn driver_setup_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DriverSetup {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection-open error
    pub fn connection_open(message: impl Into<String>) -> Self {
        Self::ConnectionOpen {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection-open error with its originating cause
    pub fn connection_open_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConnectionOpen {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a pool-exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create a stale-connection error
    pub fn stale_connection(message: impl Into<String>) -> Self {
        Self::StaleConnection {
            message: message.into(),
        }
    }

    /// Create an auto-commit-config error wrapping the driver cause
    pub fn auto_commit_config(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::AutoCommitConfig {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a driver error
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_retriable() {
        assert!(ErrorKind::ConnectionOpen.is_retriable());
        assert!(ErrorKind::PoolExhausted.is_retriable());

        assert!(!ErrorKind::DriverSetup.is_retriable());
        assert!(!ErrorKind::StaleConnection.is_retriable());
        assert!(!ErrorKind::AutoCommitConfig.is_retriable());
        assert!(!ErrorKind::Configuration.is_retriable());
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::driver_setup("x").kind(), ErrorKind::DriverSetup);
        assert_eq!(Error::pool_exhausted("x").kind(), ErrorKind::PoolExhausted);
        assert_eq!(
            Error::stale_connection("x").kind(),
            ErrorKind::StaleConnection
        );
        assert_eq!(Error::config("x").kind(), ErrorKind::Configuration);
        assert!(Error::connection_open("refused").is_retriable());
        assert!(!Error::driver("boom").is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::connection_open("connection refused");
        assert!(err.to_string().contains("connection refused"));

        let err = Error::stale_connection("Connection is invalid.");
        assert!(err.to_string().contains("invalid"));
    }

    #[test]
    fn test_error_source_chain() {
        let io = std::io::Error::other("socket reset");
        let err = Error::connection_open_with_source("open failed", io);
        let source = std::error::Error::source(&err).expect("cause attached");
        assert!(source.to_string().contains("socket reset"));
    }
}
