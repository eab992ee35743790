//! Transactions for rdbc-pool
//!
//! Two variants behind one trait:
//! - local: this layer drives commit/rollback on the connection
//! - managed: an outer transaction controller owns commit/rollback; this
//!   layer only surfaces the connection and optionally closes it

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::connection::{Connection, IsolationLevel};
use crate::datasource::{parse_bool, DataSource};
use crate::error::{Error, Result};

/// A unit of work over one lazily acquired connection.
///
/// Created by a [`TransactionFactory`], used through `connection()`,
/// committed or rolled back zero or more times, and closed exactly once;
/// closing an already-closed transaction is a no-op.
#[async_trait]
pub trait Transaction: Send {
    /// The transaction's connection, acquired on first call and cached.
    async fn connection(&mut self) -> Result<&dyn Connection>;

    /// Commit the unit of work.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the unit of work.
    async fn rollback(&mut self) -> Result<()>;

    /// Release the transaction's resources.
    async fn close(&mut self) -> Result<()>;

    /// Transaction timeout, when the implementation has one.
    async fn timeout(&mut self) -> Result<Option<Duration>> {
        Ok(None)
    }
}

/// Negotiate the connection's auto-commit setting, touching the driver
/// only when the current value differs. Driver refusal surfaces as an
/// auto-commit-config error wrapping the cause.
async fn set_desired_auto_commit(conn: &dyn Connection, desired: bool) -> Result<()> {
    let negotiate = async {
        if conn.auto_commit().await? != desired {
            debug!(desired, "setting auto-commit on connection");
            conn.set_auto_commit(desired).await?;
        }
        Ok::<(), Error>(())
    };
    negotiate.await.map_err(|e| {
        Error::auto_commit_config(
            format!(
                "error configuring auto-commit; your driver may not support \
                 auto-commit negotiation (requested setting: {desired})"
            ),
            e,
        )
    })
}

/// A transaction that drives commit and rollback itself.
pub struct LocalTransaction {
    connection: Option<Box<dyn Connection>>,
    data_source: Option<Arc<dyn DataSource>>,
    isolation: Option<IsolationLevel>,
    desired_auto_commit: bool,
    skip_auto_commit_reset_on_close: bool,
}

impl LocalTransaction {
    /// Create a transaction that acquires its connection lazily from a
    /// datasource.
    pub fn new(
        data_source: Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        desired_auto_commit: bool,
        skip_auto_commit_reset_on_close: bool,
    ) -> Self {
        Self {
            connection: None,
            data_source: Some(data_source),
            isolation,
            desired_auto_commit,
            skip_auto_commit_reset_on_close,
        }
    }

    /// Wrap a pre-supplied connection. Connection setup is skipped;
    /// commit, rollback, and close still route through this transaction.
    pub fn from_connection(connection: Box<dyn Connection>) -> Self {
        Self {
            connection: Some(connection),
            data_source: None,
            isolation: None,
            desired_auto_commit: true,
            skip_auto_commit_reset_on_close: false,
        }
    }

    async fn open_connection(&mut self) -> Result<()> {
        debug!("opening connection");
        let data_source = self
            .data_source
            .as_ref()
            .ok_or_else(|| Error::transaction("no datasource configured"))?;
        let conn = data_source.connection().await?;
        if let Some(level) = self.isolation {
            conn.set_isolation(level).await?;
        }
        set_desired_auto_commit(conn.as_ref(), self.desired_auto_commit).await?;
        self.connection = Some(conn);
        Ok(())
    }

    /// Put auto-commit back to true before handing the connection back,
    /// unless configured not to. Some databases insist on an explicit
    /// commit or rollback before close, so failures here are only logged.
    async fn reset_auto_commit(&self, conn: &dyn Connection) {
        let reset = async {
            if !self.skip_auto_commit_reset_on_close && !conn.auto_commit().await? {
                debug!("resetting auto-commit to true before closing the connection");
                conn.set_auto_commit(true).await?;
            }
            Ok::<(), Error>(())
        };
        if let Err(e) = reset.await {
            debug!(error = %e, "error resetting auto-commit before closing the connection");
        }
    }
}

#[async_trait]
impl Transaction for LocalTransaction {
    async fn connection(&mut self) -> Result<&dyn Connection> {
        if self.connection.is_none() {
            self.open_connection().await?;
        }
        match self.connection.as_deref() {
            Some(conn) => Ok(conn),
            None => Err(Error::transaction("connection was not opened")),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(conn) = self.connection.as_deref() {
            if !conn.auto_commit().await? {
                debug!("committing connection");
                conn.commit().await?;
            }
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(conn) = self.connection.as_deref() {
            if !conn.auto_commit().await? {
                debug!("rolling back connection");
                conn.rollback().await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.connection.take() {
            self.reset_auto_commit(conn.as_ref()).await;
            debug!("closing connection");
            conn.close().await?;
        }
        Ok(())
    }
}

/// A transaction whose commit and rollback are owned by an outer
/// controller. Both are no-ops here and never touch the connection.
pub struct ManagedTransaction {
    connection: Option<Box<dyn Connection>>,
    data_source: Option<Arc<dyn DataSource>>,
    isolation: Option<IsolationLevel>,
    close_connection: bool,
}

impl ManagedTransaction {
    /// Create a transaction that acquires its connection lazily from a
    /// datasource.
    pub fn new(
        data_source: Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        close_connection: bool,
    ) -> Self {
        Self {
            connection: None,
            data_source: Some(data_source),
            isolation,
            close_connection,
        }
    }

    /// Wrap a pre-supplied connection.
    pub fn from_connection(connection: Box<dyn Connection>, close_connection: bool) -> Self {
        Self {
            connection: Some(connection),
            data_source: None,
            isolation: None,
            close_connection,
        }
    }

    async fn open_connection(&mut self) -> Result<()> {
        debug!("opening connection");
        let data_source = self
            .data_source
            .as_ref()
            .ok_or_else(|| Error::transaction("no datasource configured"))?;
        let conn = data_source.connection().await?;
        if let Some(level) = self.isolation {
            conn.set_isolation(level).await?;
        }
        self.connection = Some(conn);
        Ok(())
    }
}

#[async_trait]
impl Transaction for ManagedTransaction {
    async fn connection(&mut self) -> Result<&dyn Connection> {
        if self.connection.is_none() {
            self.open_connection().await?;
        }
        match self.connection.as_deref() {
            Some(conn) => Ok(conn),
            None => Err(Error::transaction("connection was not opened")),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.close_connection {
            return Ok(());
        }
        if let Some(conn) = self.connection.take() {
            debug!("closing connection");
            conn.close().await?;
        }
        Ok(())
    }
}

/// Builds transactions of one variant.
pub trait TransactionFactory: Send + Sync {
    /// Apply an optional property bag. Unrecognized keys are ignored.
    fn set_properties(&mut self, properties: &HashMap<String, String>) -> Result<()>;

    /// A transaction over a pre-existing connection.
    fn new_transaction(&self, connection: Box<dyn Connection>) -> Box<dyn Transaction>;

    /// A transaction that acquires its connection from `data_source`.
    fn new_transaction_from_data_source(
        &self,
        data_source: Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        auto_commit: bool,
    ) -> Box<dyn Transaction>;
}

/// Factory for [`LocalTransaction`]s.
///
/// Recognizes the `skipSetAutoCommitOnClose` boolean property.
pub struct LocalTransactionFactory {
    skip_set_auto_commit_on_close: bool,
}

impl LocalTransactionFactory {
    /// Create a factory with auto-commit reset enabled on close.
    pub fn new() -> Self {
        Self {
            skip_set_auto_commit_on_close: false,
        }
    }
}

impl Default for LocalTransactionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionFactory for LocalTransactionFactory {
    fn set_properties(&mut self, properties: &HashMap<String, String>) -> Result<()> {
        if let Some(value) = properties.get("skipSetAutoCommitOnClose") {
            self.skip_set_auto_commit_on_close = parse_bool("skipSetAutoCommitOnClose", value)?;
        }
        Ok(())
    }

    fn new_transaction(&self, connection: Box<dyn Connection>) -> Box<dyn Transaction> {
        Box::new(LocalTransaction::from_connection(connection))
    }

    fn new_transaction_from_data_source(
        &self,
        data_source: Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        auto_commit: bool,
    ) -> Box<dyn Transaction> {
        Box::new(LocalTransaction::new(
            data_source,
            isolation,
            auto_commit,
            self.skip_set_auto_commit_on_close,
        ))
    }
}

/// Factory for [`ManagedTransaction`]s.
///
/// Recognizes the `closeConnection` boolean property, which defaults to
/// true. The auto-commit argument of the datasource route is ignored: the
/// outer controller owns transaction boundaries.
pub struct ManagedTransactionFactory {
    close_connection: bool,
}

impl ManagedTransactionFactory {
    /// Create a factory that closes connections on transaction close.
    pub fn new() -> Self {
        Self {
            close_connection: true,
        }
    }
}

impl Default for ManagedTransactionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionFactory for ManagedTransactionFactory {
    fn set_properties(&mut self, properties: &HashMap<String, String>) -> Result<()> {
        if let Some(value) = properties.get("closeConnection") {
            self.close_connection = parse_bool("closeConnection", value)?;
        }
        Ok(())
    }

    fn new_transaction(&self, connection: Box<dyn Connection>) -> Box<dyn Transaction> {
        Box::new(ManagedTransaction::from_connection(
            connection,
            self.close_connection,
        ))
    }

    fn new_transaction_from_data_source(
        &self,
        data_source: Arc<dyn DataSource>,
        isolation: Option<IsolationLevel>,
        _auto_commit: bool,
    ) -> Box<dyn Transaction> {
        Box::new(ManagedTransaction::new(
            data_source,
            isolation,
            self.close_connection,
        ))
    }
}
