//! In-memory stub driver shared by the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdbc_pool::prelude::*;

/// Observable state of one stub connection, shared with the test body.
#[derive(Debug)]
pub struct StubState {
    pub closed: AtomicBool,
    pub auto_commit: AtomicBool,
    pub fail_execute: AtomicBool,
    pub fail_set_auto_commit: AtomicBool,
    pub executed: Mutex<Vec<String>>,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub isolation: Mutex<Option<IsolationLevel>>,
    pub network_timeout: Mutex<Option<Duration>>,
}

impl StubState {
    fn new(born_closed: bool, refuses_auto_commit: bool) -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(born_closed),
            auto_commit: AtomicBool::new(true),
            fail_execute: AtomicBool::new(false),
            fail_set_auto_commit: AtomicBool::new(refuses_auto_commit),
            executed: Mutex::new(Vec::new()),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            isolation: Mutex::new(None),
            network_timeout: Mutex::new(None),
        })
    }
}

pub struct StubConnection {
    state: Arc<StubState>,
}

impl std::fmt::Debug for StubConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubConnection").finish_non_exhaustive()
    }
}

impl StubConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            Err(Error::driver("connection is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for StubConnection {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.ensure_open()?;
        if self.state.fail_execute.load(Ordering::SeqCst) {
            return Err(Error::driver("simulated execute failure"));
        }
        self.state.executed.lock().unwrap().push(sql.to_string());
        Ok(0)
    }

    async fn auto_commit(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.state.auto_commit.load(Ordering::SeqCst))
    }

    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        self.ensure_open()?;
        if self.state.fail_set_auto_commit.load(Ordering::SeqCst) {
            return Err(Error::driver("auto-commit not supported"));
        }
        self.state.auto_commit.store(auto_commit, Ordering::SeqCst);
        Ok(())
    }

    async fn set_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.ensure_open()?;
        *self.state.isolation.lock().unwrap() = Some(level);
        Ok(())
    }

    async fn set_network_timeout(&self, timeout: Duration) -> Result<()> {
        self.ensure_open()?;
        *self.state.network_timeout.lock().unwrap() = Some(timeout);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Driver producing stub connections, with switches for failure injection.
#[derive(Debug)]
pub struct StubDriver {
    pub fail_connect: AtomicBool,
    /// When set, new connections report closed from birth.
    pub open_broken: AtomicBool,
    /// When set, new connections refuse auto-commit changes.
    pub open_refusing_auto_commit: AtomicBool,
    opened: AtomicUsize,
    connections: Mutex<Vec<Arc<StubState>>>,
    last_properties: Mutex<Option<HashMap<String, String>>>,
}

impl StubDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_connect: AtomicBool::new(false),
            open_broken: AtomicBool::new(false),
            open_refusing_auto_commit: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
            connections: Mutex::new(Vec::new()),
            last_properties: Mutex::new(None),
        })
    }

    /// Number of physical connections opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// State of the `index`-th opened connection.
    pub fn connection_state(&self, index: usize) -> Arc<StubState> {
        self.connections.lock().unwrap()[index].clone()
    }

    /// The property bag passed to the most recent open.
    pub fn last_properties(&self) -> HashMap<String, String> {
        self.last_properties.lock().unwrap().clone().unwrap_or_default()
    }
}

#[async_trait]
impl Driver for StubDriver {
    async fn connect(
        &self,
        _url: &str,
        properties: &HashMap<String, String>,
    ) -> Result<Box<dyn Connection>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection_open("simulated refusal"));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.last_properties.lock().unwrap() = Some(properties.clone());
        let state = StubState::new(
            self.open_broken.load(Ordering::SeqCst),
            self.open_refusing_auto_commit.load(Ordering::SeqCst),
        );
        self.connections.lock().unwrap().push(state.clone());
        Ok(Box::new(StubConnection { state }))
    }
}

/// Register a fresh stub driver under a process-unique name.
pub fn register_stub_driver() -> (String, Arc<StubDriver>) {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let name = format!("stub-{}", NEXT.fetch_add(1, Ordering::SeqCst));
    let driver = StubDriver::new();
    DriverRegistry::global().register(name.clone(), driver.clone());
    (name, driver)
}

/// A pooled datasource over a fresh stub driver.
pub fn stub_pool(pool_config: PoolConfig) -> (PooledDataSource, Arc<StubDriver>) {
    let (name, driver) = register_stub_driver();
    let pool = PooledDataSource::new(
        DataSourceConfig::new(name, "db://localhost/app").with_credentials("app", "secret"),
        pool_config,
    );
    (pool, driver)
}

/// An unpooled datasource over a fresh stub driver.
pub fn stub_source(config: impl FnOnce(DataSourceConfig) -> DataSourceConfig) -> (UnpooledDataSource, Arc<StubDriver>) {
    let (name, driver) = register_stub_driver();
    let source_config = config(
        DataSourceConfig::new(name, "db://localhost/app").with_credentials("app", "secret"),
    );
    (UnpooledDataSource::new(source_config), driver)
}
