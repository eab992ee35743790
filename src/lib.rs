//! # rdbc-pool
//!
//! Pooled and unpooled datasources with pluggable drivers and a minimal
//! transaction abstraction for data-access layers.
//!
//! Applications borrow logical connections from a [`PooledDataSource`];
//! closing a logical connection returns the physical connection to the
//! pool for reuse instead of destroying it. On top sits a transaction
//! layer that lets higher layers drive commit/rollback without caring
//! whether the transaction is locally owned or controlled by an external
//! transaction manager.
//!
//! ## Features
//!
//! - **Driver Gateway**: process-wide, idempotent driver registration
//! - **Connection Pooling**: idle reuse, overdue-borrow reclaim, bounded
//!   waits, ping-based liveness checks, live statistics
//! - **Safe Reconfiguration**: identity-changing setters flush the pool so
//!   stale connections are never reused
//! - **Transactions**: local (commit/rollback driven here) and managed
//!   (driven by an outer controller) variants with property-configured
//!   factories
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rdbc_pool::prelude::*;
//!
//! DriverRegistry::global().register("mydb", Arc::new(MyDriver));
//!
//! let pool = PooledDataSource::new(
//!     DataSourceConfig::new("mydb", "db://localhost/app")
//!         .with_credentials("app", "secret"),
//!     PoolConfig::new().with_maximum_active_connections(10),
//! );
//!
//! let conn = pool.get().await?;
//! conn.execute("UPDATE jobs SET state = 'done'").await?;
//! conn.close().await?; // returns to the pool
//!
//! println!("{}", pool.status().await);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod datasource;
pub mod driver;
pub mod error;
pub mod pool;
pub mod transaction;
pub mod unpooled;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorKind, Result};

    // Connection capability
    pub use crate::connection::{Connection, IsolationLevel};

    // Driver gateway
    pub use crate::driver::{Driver, DriverRegistry, DriverShim};

    // DataSource abstractions
    pub use crate::datasource::{
        DataSource, DataSourceFactory, LookupDataSourceFactory, NamingContext,
    };

    // Unpooled source
    pub use crate::unpooled::{DataSourceConfig, UnpooledDataSource, UnpooledDataSourceFactory};

    // Pool types
    pub use crate::pool::{
        PoolConfig, PoolStatus, PooledConnection, PooledDataSource, PooledDataSourceFactory,
    };

    // Transactions
    pub use crate::transaction::{
        LocalTransaction, LocalTransactionFactory, ManagedTransaction, ManagedTransactionFactory,
        Transaction, TransactionFactory,
    };
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use pool::{PooledConnection, PooledDataSource};

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        // Ensure common types are accessible
        let _config = DataSourceConfig::new("testdb", "db://localhost/test");
        let _pool_config = PoolConfig::default();
        let _level = IsolationLevel::ReadCommitted;
        let _factory = LocalTransactionFactory::new();
    }

    #[test]
    fn test_error_kinds() {
        let err = Error::pool_exhausted("no connections");
        assert!(err.is_retriable());
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    }
}
