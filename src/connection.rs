//! Connection capability for rdbc-pool
//!
//! Core abstraction for the physical driver layer:
//! - Connection: the contract every driver connection must honor
//! - IsolationLevel: standard transaction isolation levels with their
//!   wire-compatible integer codes

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// A physical connection to a database.
///
/// This is the whole contract the pooling and transaction layers assume
/// of a driver: execute a small SQL string, negotiate auto-commit, apply
/// session settings, and terminate. Statement handling and result-set
/// mapping live above this crate.
#[async_trait]
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Execute a SQL string, returning the affected row count
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Query the connection's current auto-commit setting
    async fn auto_commit(&self) -> Result<bool>;

    /// Change the connection's auto-commit setting
    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()>;

    /// Set the transaction isolation level for this session
    async fn set_isolation(&self, level: IsolationLevel) -> Result<()>;

    /// Set the network timeout applied to driver I/O
    async fn set_network_timeout(&self, timeout: Duration) -> Result<()>;

    /// Commit the current transaction
    async fn commit(&self) -> Result<()>;

    /// Roll back the current transaction
    async fn rollback(&self) -> Result<()>;

    /// Whether the connection has been closed
    fn is_closed(&self) -> bool;

    /// Close the connection, releasing driver resources
    async fn close(&self) -> Result<()>;
}

/// Transaction isolation levels
///
/// The integer codes match the standard JDBC constants so configuration
/// written against a JDBC-style property surface keeps working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Transactions are not supported
    None,
    /// Dirty reads possible
    ReadUncommitted,
    /// No dirty reads
    ReadCommitted,
    /// No non-repeatable reads
    RepeatableRead,
    /// Full isolation
    Serializable,
    /// Snapshot isolation (SQL Server specific)
    SqlServerSnapshot,
}

impl IsolationLevel {
    /// The wire-compatible integer code for this level
    pub const fn code(self) -> i32 {
        match self {
            Self::None => 0,
            Self::ReadUncommitted => 1,
            Self::ReadCommitted => 2,
            Self::RepeatableRead => 4,
            Self::Serializable => 8,
            Self::SqlServerSnapshot => 0x1000,
        }
    }

    /// Resolve a level from its integer code
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::ReadUncommitted),
            2 => Some(Self::ReadCommitted),
            4 => Some(Self::RepeatableRead),
            8 => Some(Self::Serializable),
            0x1000 => Some(Self::SqlServerSnapshot),
            _ => None,
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            Self::ReadCommitted => write!(f, "READ COMMITTED"),
            Self::RepeatableRead => write!(f, "REPEATABLE READ"),
            Self::Serializable => write!(f, "SERIALIZABLE"),
            Self::SqlServerSnapshot => write!(f, "SNAPSHOT"),
        }
    }
}
