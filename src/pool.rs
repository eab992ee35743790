//! Connection pool for rdbc-pool
//!
//! The pooled datasource keeps physical connections alive across logical
//! "close" calls:
//! - borrow serves from the idle list, opens a fresh connection while
//!   under the active cap, reclaims the oldest overdue borrower, or waits
//! - return re-wraps the physical connection into the idle list, or closes
//!   it when the pool is full or the configuration drifted
//! - an optional ping query validates candidates before handoff
//!
//! All list and counter mutations happen under one async mutex; a single
//! [`Notify`] wakes one waiter per return.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::connection::{Connection, IsolationLevel};
use crate::datasource::{parse_bool, parse_int, DataSource, DataSourceFactory};
use crate::error::{Error, Result};
use crate::unpooled::{
    redact_url, DataSourceConfig, UnpooledDataSource, UnpooledDataSourceFactory,
};

/// Milliseconds elapsed since the process-wide monotonic epoch.
fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64
}

/// Pool policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Hard cap on connections lent out at once
    pub maximum_active_connections: usize,
    /// Hard cap on connections kept idle for reuse
    pub maximum_idle_connections: usize,
    /// Checkout duration after which a borrow becomes reclaimable
    pub maximum_checkout_time: Duration,
    /// Upper bound of one wait cycle for a free connection
    pub time_to_wait: Duration,
    /// Extra validation failures tolerated by a single borrow call on top
    /// of `maximum_idle_connections`
    pub maximum_local_bad_connection_tolerance: usize,
    /// Probe SQL executed against candidates when pinging is enabled
    pub ping_query: String,
    /// Whether to run the probe at all
    pub ping_enabled: bool,
    /// Idle duration beyond which a candidate is probed
    pub ping_connections_not_used_for: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            maximum_active_connections: 10,
            maximum_idle_connections: 5,
            maximum_checkout_time: Duration::from_millis(20_000),
            time_to_wait: Duration::from_millis(20_000),
            maximum_local_bad_connection_tolerance: 3,
            ping_query: "NO PING QUERY SET".to_string(),
            ping_enabled: false,
            ping_connections_not_used_for: Duration::ZERO,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the default knobs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the active-connection cap
    pub fn with_maximum_active_connections(mut self, n: usize) -> Self {
        self.maximum_active_connections = n;
        self
    }

    /// Set the idle-connection cap
    pub fn with_maximum_idle_connections(mut self, n: usize) -> Self {
        self.maximum_idle_connections = n;
        self
    }

    /// Set the reclaimable checkout duration
    pub fn with_maximum_checkout_time(mut self, d: Duration) -> Self {
        self.maximum_checkout_time = d;
        self
    }

    /// Set the per-cycle wait bound
    pub fn with_time_to_wait(mut self, d: Duration) -> Self {
        self.time_to_wait = d;
        self
    }

    /// Set the extra bad-connection tolerance per borrow call
    pub fn with_maximum_local_bad_connection_tolerance(mut self, n: usize) -> Self {
        self.maximum_local_bad_connection_tolerance = n;
        self
    }

    /// Set the probe SQL
    pub fn with_ping_query(mut self, sql: impl Into<String>) -> Self {
        self.ping_query = sql.into();
        self
    }

    /// Enable or disable the probe
    pub fn with_ping_enabled(mut self, enabled: bool) -> Self {
        self.ping_enabled = enabled;
        self
    }

    /// Set the idle threshold beyond which candidates are probed
    pub fn with_ping_connections_not_used_for(mut self, d: Duration) -> Self {
        self.ping_connections_not_used_for = d;
        self
    }
}

/// A physical connection plus the stable fingerprint assigned at open.
pub(crate) struct RealConnection {
    conn: Box<dyn Connection>,
    id: u64,
}

impl RealConnection {
    fn new(conn: Box<dyn Connection>) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            conn,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

/// One borrowable slot: the physical connection plus lifecycle metadata.
///
/// A member is in exactly one of three states: idle (in the idle list),
/// active (in the active list, held by one caller), or dead (`valid`
/// cleared, in no list). Only the engine transitions members, under its
/// mutex; the atomics exist so caller-facing handles can read metadata
/// without taking it.
pub(crate) struct PoolMember {
    real: Arc<RealConnection>,
    created_at_ms: u64,
    last_used_at_ms: AtomicU64,
    checked_out_at_ms: AtomicU64,
    connection_type_code: AtomicU64,
    valid: AtomicBool,
}

impl PoolMember {
    fn new(real: Arc<RealConnection>) -> Self {
        let now = now_ms();
        Self::adopt(real, now, now)
    }

    /// Wrap a physical connection, carrying over lifecycle timestamps from
    /// the member it replaces.
    fn adopt(real: Arc<RealConnection>, created_at_ms: u64, last_used_at_ms: u64) -> Self {
        Self {
            real,
            created_at_ms,
            last_used_at_ms: AtomicU64::new(last_used_at_ms),
            checked_out_at_ms: AtomicU64::new(now_ms()),
            connection_type_code: AtomicU64::new(0),
            valid: AtomicBool::new(true),
        }
    }

    fn real_id(&self) -> u64 {
        self.real.id
    }

    fn is_valid_flag(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn created_at(&self) -> u64 {
        self.created_at_ms
    }

    fn last_used_at(&self) -> u64 {
        self.last_used_at_ms.load(Ordering::Acquire)
    }

    fn set_last_used_now(&self) {
        self.last_used_at_ms.store(now_ms(), Ordering::Release);
    }

    fn set_checked_out_now(&self) {
        self.checked_out_at_ms.store(now_ms(), Ordering::Release);
    }

    fn connection_type_code(&self) -> u64 {
        self.connection_type_code.load(Ordering::Acquire)
    }

    fn set_connection_type_code(&self, code: u64) {
        self.connection_type_code.store(code, Ordering::Release);
    }

    fn age(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.created_at_ms))
    }

    fn idle_time(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.last_used_at()))
    }

    fn checkout_time(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.checked_out_at_ms.load(Ordering::Acquire)))
    }
}

/// Lists and counters guarded by the pool mutex.
struct PoolState {
    idle: VecDeque<Arc<PoolMember>>,
    active: Vec<Arc<PoolMember>>,
    expected_connection_type_code: u64,
    request_count: u64,
    accumulated_request_time_ms: u64,
    accumulated_checkout_time_ms: u64,
    claimed_overdue_connection_count: u64,
    accumulated_checkout_time_of_overdue_connections_ms: u64,
    accumulated_wait_time_ms: u64,
    had_to_wait_count: u64,
    bad_connection_count: u64,
}

impl PoolState {
    fn new(expected_connection_type_code: u64) -> Self {
        Self {
            idle: VecDeque::new(),
            active: Vec::new(),
            expected_connection_type_code,
            request_count: 0,
            accumulated_request_time_ms: 0,
            accumulated_checkout_time_ms: 0,
            claimed_overdue_connection_count: 0,
            accumulated_checkout_time_of_overdue_connections_ms: 0,
            accumulated_wait_time_ms: 0,
            had_to_wait_count: 0,
            bad_connection_count: 0,
        }
    }
}

struct PoolShared {
    source: UnpooledDataSource,
    config: RwLock<PoolConfig>,
    state: Mutex<PoolState>,
    available: Notify,
}

impl PoolShared {
    fn pool_config(&self) -> PoolConfig {
        self.config.read().expect("pool config poisoned").clone()
    }

    fn assemble_connection_type_code(
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        url.hash(&mut hasher);
        username.unwrap_or("").hash(&mut hasher);
        password.unwrap_or("").hash(&mut hasher);
        hasher.finish()
    }

    fn expected_code_from_source(&self) -> u64 {
        let config = self.source.config();
        Self::assemble_connection_type_code(
            &config.url,
            config.username.as_deref(),
            config.password.as_deref(),
        )
    }

    /// Liveness probe. Closed connections fail immediately; when pinging
    /// is enabled and the candidate has idled past the threshold, the
    /// probe SQL runs (with a rollback afterwards when auto-commit is
    /// off). Any probe failure closes the physical connection.
    async fn ping(&self, member: &PoolMember, config: &PoolConfig) -> bool {
        if member.real.conn.is_closed() {
            debug!(connection = member.real_id(), "connection is BAD: already closed");
            return false;
        }
        if !config.ping_enabled || member.idle_time() <= config.ping_connections_not_used_for {
            return true;
        }

        debug!(connection = member.real_id(), "testing connection");
        let probe = async {
            member.real.conn.execute(&config.ping_query).await?;
            if !member.real.conn.auto_commit().await? {
                member.real.conn.rollback().await?;
            }
            Ok::<(), Error>(())
        };
        match probe.await {
            Ok(()) => {
                debug!(connection = member.real_id(), "connection is GOOD");
                true
            }
            Err(e) => {
                warn!(
                    query = %config.ping_query,
                    error = %e,
                    "execution of ping query failed"
                );
                let _ = member.real.conn.close().await;
                debug!(connection = member.real_id(), "connection is BAD");
                false
            }
        }
    }

    async fn is_valid(&self, member: &PoolMember, config: &PoolConfig) -> bool {
        member.is_valid_flag() && self.ping(member, config).await
    }

    /// Roll back the physical connection when auto-commit is off.
    /// Failures (including failure to query auto-commit on a broken
    /// connection) are logged and swallowed; validation will catch a
    /// genuinely dead connection.
    async fn rollback_if_required(&self, member: &PoolMember) {
        if !member.real.conn.auto_commit().await.unwrap_or(true) {
            if let Err(e) = member.real.conn.rollback().await {
                debug!(
                    connection = member.real_id(),
                    error = %e,
                    "bad connection, could not roll back"
                );
            }
        }
    }

    /// The borrow path. Loops until a validated connection is stamped into
    /// the active list or the call's bad-connection tolerance is exceeded.
    async fn pop_connection(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Arc<PoolMember>> {
        let started = Instant::now();
        let mut counted_wait = false;
        let mut local_bad_connection_count: usize = 0;
        let mut pending_wait: Option<Duration> = None;

        loop {
            let config = self.pool_config();
            let mut state = self.state.lock().await;
            if let Some(waited) = pending_wait.take() {
                state.accumulated_wait_time_ms += waited.as_millis() as u64;
            }

            let candidate: Arc<PoolMember>;
            if let Some(member) = state.idle.pop_front() {
                debug!(connection = member.real_id(), "checked out connection from pool");
                candidate = member;
            } else if state.active.len() < config.maximum_active_connections {
                let conn = self.source.connection().await?;
                let real = Arc::new(RealConnection::new(conn));
                debug!(connection = real.id, "created connection");
                candidate = Arc::new(PoolMember::new(real));
            } else {
                let oldest = state.active[0].clone();
                let longest_checkout = oldest.checkout_time();
                if longest_checkout > config.maximum_checkout_time {
                    // Claim the overdue borrower: its physical connection
                    // moves to this caller, its old handle goes stale.
                    state.claimed_overdue_connection_count += 1;
                    state.accumulated_checkout_time_of_overdue_connections_ms +=
                        longest_checkout.as_millis() as u64;
                    state.accumulated_checkout_time_ms += longest_checkout.as_millis() as u64;
                    state.active.remove(0);
                    self.rollback_if_required(&oldest).await;
                    let reclaimed = Arc::new(PoolMember::adopt(
                        oldest.real.clone(),
                        oldest.created_at(),
                        oldest.last_used_at(),
                    ));
                    oldest.invalidate();
                    debug!(connection = reclaimed.real_id(), "claimed overdue connection");
                    candidate = reclaimed;
                } else {
                    if !counted_wait {
                        state.had_to_wait_count += 1;
                        counted_wait = true;
                    }
                    debug!(
                        "waiting as long as {} ms for connection",
                        config.time_to_wait.as_millis()
                    );
                    // Register for the wakeup before releasing the mutex
                    // so a return between unlock and await is not missed.
                    let notified = self.available.notified();
                    drop(state);
                    let wait_started = Instant::now();
                    let _ = tokio::time::timeout(config.time_to_wait, notified).await;
                    pending_wait = Some(wait_started.elapsed());
                    continue;
                }
            }

            if self.is_valid(&candidate, &config).await {
                self.rollback_if_required(&candidate).await;
                let source_config = self.source.config();
                candidate.set_connection_type_code(Self::assemble_connection_type_code(
                    &source_config.url,
                    username,
                    password,
                ));
                candidate.set_checked_out_now();
                candidate.set_last_used_now();
                state.active.push(candidate.clone());
                state.request_count += 1;
                state.accumulated_request_time_ms += started.elapsed().as_millis() as u64;
                return Ok(candidate);
            }

            debug!(
                connection = candidate.real_id(),
                "a bad connection was returned from the pool, getting another connection"
            );
            state.bad_connection_count += 1;
            local_bad_connection_count += 1;
            if local_bad_connection_count
                > config.maximum_idle_connections + config.maximum_local_bad_connection_tolerance
            {
                debug!("could not get a good connection to the database");
                return Err(Error::pool_exhausted(
                    "could not get a good connection to the database",
                ));
            }
        }
    }

    /// The return path. Never surfaces an error: driver failures are
    /// swallowed after updating statistics.
    async fn push_connection(&self, member: Arc<PoolMember>) {
        let config = self.pool_config();
        let mut state = self.state.lock().await;
        if let Some(pos) = state.active.iter().position(|m| Arc::ptr_eq(m, &member)) {
            state.active.remove(pos);
        }

        if self.is_valid(&member, &config).await {
            let checkout_ms = member.checkout_time().as_millis() as u64;
            state.accumulated_checkout_time_ms += checkout_ms;
            if state.idle.len() < config.maximum_idle_connections
                && member.connection_type_code() == state.expected_connection_type_code
            {
                self.rollback_if_required(&member).await;
                // Re-wrap the physical connection so a retained handle to
                // the returned member cannot reach it again.
                let fresh = Arc::new(PoolMember::adopt(
                    member.real.clone(),
                    member.created_at(),
                    member.last_used_at(),
                ));
                member.invalidate();
                debug!(connection = fresh.real_id(), "returned connection to pool");
                state.idle.push_back(fresh);
                self.available.notify_one();
            } else {
                // Pool full, or the pool was reconfigured while this
                // connection was out: close instead of reusing.
                self.rollback_if_required(&member).await;
                let _ = member.real.conn.close().await;
                debug!(connection = member.real_id(), "closed connection");
                member.invalidate();
            }
        } else {
            debug!(
                connection = member.real_id(),
                "a bad connection attempted to return to the pool, discarding connection"
            );
            state.bad_connection_count += 1;
        }
    }

    /// Empty both lists, invalidating every record. Records held by
    /// borrowers go stale in place; their eventual return closes the
    /// physical connection via the type-code check.
    async fn force_close_all(&self) {
        let mut state = self.state.lock().await;
        state.expected_connection_type_code = self.expected_code_from_source();
        while let Some(member) = state.active.pop() {
            member.invalidate();
            self.rollback_if_required(&member).await;
            let _ = member.real.conn.close().await;
        }
        while let Some(member) = state.idle.pop_back() {
            member.invalidate();
            self.rollback_if_required(&member).await;
            let _ = member.real.conn.close().await;
        }
        debug!("forcefully closed/removed all connections");
    }
}

/// A logical connection lent out by the pool.
///
/// Implements the full [`Connection`] capability. `close` returns the
/// physical connection to the pool instead of closing it; every other
/// method fails with a stale-connection error once the handle has been
/// invalidated (returned, reclaimed, or flushed). Dropping a still-valid
/// handle returns it in the background.
pub struct PooledConnection {
    member: Arc<PoolMember>,
    pool: Arc<PoolShared>,
}

impl PooledConnection {
    fn check_valid(&self) -> Result<()> {
        if self.member.is_valid_flag() {
            Ok(())
        } else {
            Err(Error::stale_connection(
                "error accessing PooledConnection: connection is invalid",
            ))
        }
    }

    /// Stable fingerprint of the underlying physical connection.
    pub fn real_id(&self) -> u64 {
        self.member.real_id()
    }

    /// Time since the physical connection was first pooled.
    pub fn age(&self) -> Duration {
        self.member.age()
    }

    /// Time since the connection was last used.
    pub fn idle_time(&self) -> Duration {
        self.member.idle_time()
    }

    /// Time since this handle was borrowed.
    pub fn checkout_time(&self) -> Duration {
        self.member.checkout_time()
    }

    /// Whether the handle is still live and passes the pool's liveness
    /// probe.
    pub async fn is_valid(&self) -> bool {
        let config = self.pool.pool_config();
        self.pool.is_valid(&self.member, &config).await
    }

    /// Mark the handle unusable. No other side effects.
    pub fn invalidate(&self) {
        self.member.invalidate();
    }
}

impl PartialEq for PooledConnection {
    fn eq(&self, other: &Self) -> bool {
        self.member.real_id() == other.member.real_id()
    }
}

impl Eq for PooledConnection {}

impl std::hash::Hash for PooledConnection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.member.real_id().hash(state);
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("real_id", &self.member.real_id())
            .field("valid", &self.member.is_valid_flag())
            .finish()
    }
}

#[async_trait]
impl Connection for PooledConnection {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.check_valid()?;
        self.member.real.conn.execute(sql).await
    }

    async fn auto_commit(&self) -> Result<bool> {
        self.check_valid()?;
        self.member.real.conn.auto_commit().await
    }

    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        self.check_valid()?;
        self.member.real.conn.set_auto_commit(auto_commit).await
    }

    async fn set_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.check_valid()?;
        self.member.real.conn.set_isolation(level).await
    }

    async fn set_network_timeout(&self, timeout: Duration) -> Result<()> {
        self.check_valid()?;
        self.member.real.conn.set_network_timeout(timeout).await
    }

    async fn commit(&self) -> Result<()> {
        self.check_valid()?;
        self.member.real.conn.commit().await
    }

    async fn rollback(&self) -> Result<()> {
        self.check_valid()?;
        self.member.real.conn.rollback().await
    }

    fn is_closed(&self) -> bool {
        !self.member.is_valid_flag() || self.member.real.conn.is_closed()
    }

    async fn close(&self) -> Result<()> {
        // Closing an already-invalidated handle is a no-op; closing never
        // touches the physical connection directly.
        if !self.member.is_valid_flag() {
            return Ok(());
        }
        self.pool.push_connection(self.member.clone()).await;
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.member.is_valid_flag() {
            return;
        }
        let pool = self.pool.clone();
        let member = self.member.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                pool.push_connection(member).await;
            });
        }
    }
}

/// A datasource that pools physical connections.
///
/// Cheap to clone; all clones share one engine. Every setter that changes
/// the connection identity (driver, url, credentials, session settings)
/// or a pool knob flushes the pool so stale connections cannot be reused.
#[derive(Clone)]
pub struct PooledDataSource {
    shared: Arc<PoolShared>,
}

impl PooledDataSource {
    /// Create a pool over a fresh unpooled source.
    pub fn new(source_config: DataSourceConfig, pool_config: PoolConfig) -> Self {
        Self::with_source(UnpooledDataSource::new(source_config), pool_config)
    }

    /// Create a pool over an existing unpooled source.
    pub fn with_source(source: UnpooledDataSource, pool_config: PoolConfig) -> Self {
        let source_config = source.config();
        let expected = PoolShared::assemble_connection_type_code(
            &source_config.url,
            source_config.username.as_deref(),
            source_config.password.as_deref(),
        );
        Self {
            shared: Arc::new(PoolShared {
                source,
                config: RwLock::new(pool_config),
                state: Mutex::new(PoolState::new(expected)),
                available: Notify::new(),
            }),
        }
    }

    /// Borrow a connection using the configured credentials.
    pub async fn get(&self) -> Result<PooledConnection> {
        let config = self.shared.source.config();
        self.get_as(config.username.as_deref(), config.password.as_deref())
            .await
    }

    /// Borrow a connection for the given credentials.
    pub async fn get_as(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<PooledConnection> {
        let member = self.shared.pop_connection(username, password).await?;
        Ok(PooledConnection {
            member,
            pool: self.shared.clone(),
        })
    }

    /// Run the liveness probe against a borrowed connection.
    pub async fn ping(&self, conn: &PooledConnection) -> bool {
        let config = self.shared.pool_config();
        self.shared.ping(&conn.member, &config).await
    }

    /// Close every pooled connection, idle and active.
    pub async fn force_close_all(&self) {
        self.shared.force_close_all().await;
    }

    /// A snapshot of the source configuration.
    pub fn source_config(&self) -> DataSourceConfig {
        self.shared.source.config()
    }

    /// A snapshot of the pool knobs.
    pub fn pool_config(&self) -> PoolConfig {
        self.shared.pool_config()
    }

    /// Number of connections currently idle.
    pub async fn idle_connection_count(&self) -> usize {
        self.shared.state.lock().await.idle.len()
    }

    /// Number of connections currently lent out.
    pub async fn active_connection_count(&self) -> usize {
        self.shared.state.lock().await.active.len()
    }

    /// Change the driver name and flush the pool.
    pub async fn set_driver(&self, driver: impl Into<String>) {
        let driver = driver.into();
        self.shared.source.update_config(|c| c.driver = driver);
        self.force_close_all().await;
    }

    /// Change the connection URL and flush the pool.
    pub async fn set_url(&self, url: impl Into<String>) {
        let url = url.into();
        self.shared.source.update_config(|c| c.url = url);
        self.force_close_all().await;
    }

    /// Change the default username and flush the pool.
    pub async fn set_username(&self, username: impl Into<String>) {
        let username = username.into();
        self.shared.source.update_config(|c| c.username = Some(username));
        self.force_close_all().await;
    }

    /// Change the default password and flush the pool.
    pub async fn set_password(&self, password: impl Into<String>) {
        let password = password.into();
        self.shared.source.update_config(|c| c.password = Some(password));
        self.force_close_all().await;
    }

    /// Replace the driver property bag and flush the pool.
    pub async fn set_driver_properties(&self, properties: HashMap<String, String>) {
        self.shared
            .source
            .update_config(|c| c.driver_properties = properties);
        self.force_close_all().await;
    }

    /// Change the desired auto-commit setting and flush the pool.
    pub async fn set_default_auto_commit(&self, auto_commit: bool) {
        self.shared
            .source
            .update_config(|c| c.auto_commit = Some(auto_commit));
        self.force_close_all().await;
    }

    /// Change the default isolation level and flush the pool.
    pub async fn set_default_isolation(&self, level: IsolationLevel) {
        self.shared
            .source
            .update_config(|c| c.default_isolation = Some(level));
        self.force_close_all().await;
    }

    /// Change the default network timeout and flush the pool.
    pub async fn set_default_network_timeout(&self, timeout: Duration) {
        self.shared
            .source
            .update_config(|c| c.default_network_timeout = Some(timeout));
        self.force_close_all().await;
    }

    /// Change the active-connection cap and flush the pool.
    pub async fn set_maximum_active_connections(&self, n: usize) {
        self.update_pool_config(|c| c.maximum_active_connections = n).await;
    }

    /// Change the idle-connection cap and flush the pool.
    pub async fn set_maximum_idle_connections(&self, n: usize) {
        self.update_pool_config(|c| c.maximum_idle_connections = n).await;
    }

    /// Change the reclaimable checkout duration and flush the pool.
    pub async fn set_maximum_checkout_time(&self, d: Duration) {
        self.update_pool_config(|c| c.maximum_checkout_time = d).await;
    }

    /// Change the per-cycle wait bound and flush the pool.
    pub async fn set_time_to_wait(&self, d: Duration) {
        self.update_pool_config(|c| c.time_to_wait = d).await;
    }

    /// Change the per-borrow bad-connection tolerance and flush the pool.
    pub async fn set_maximum_local_bad_connection_tolerance(&self, n: usize) {
        self.update_pool_config(|c| c.maximum_local_bad_connection_tolerance = n)
            .await;
    }

    /// Change the probe SQL and flush the pool.
    pub async fn set_ping_query(&self, sql: impl Into<String>) {
        let sql = sql.into();
        self.update_pool_config(|c| c.ping_query = sql).await;
    }

    /// Enable or disable the probe and flush the pool.
    pub async fn set_ping_enabled(&self, enabled: bool) {
        self.update_pool_config(|c| c.ping_enabled = enabled).await;
    }

    /// Change the probe idle threshold and flush the pool.
    pub async fn set_ping_connections_not_used_for(&self, d: Duration) {
        self.update_pool_config(|c| c.ping_connections_not_used_for = d).await;
    }

    async fn update_pool_config(&self, apply: impl FnOnce(&mut PoolConfig)) {
        {
            let mut config = self.shared.config.write().expect("pool config poisoned");
            apply(&mut config);
        }
        self.force_close_all().await;
    }

    /// An immutable snapshot of configuration and live counters, assembled
    /// under the pool mutex.
    pub async fn status(&self) -> PoolStatus {
        let source_config = self.shared.source.config();
        let pool_config = self.shared.pool_config();
        let state = self.shared.state.lock().await;

        fn avg(total: u64, count: u64) -> u64 {
            if count == 0 {
                0
            } else {
                total / count
            }
        }

        PoolStatus {
            driver: source_config.driver.clone(),
            url: redact_url(&source_config.url),
            username: source_config.username.clone(),
            password: source_config.password.as_ref().map(|_| "************".to_string()),
            maximum_active_connections: pool_config.maximum_active_connections,
            maximum_idle_connections: pool_config.maximum_idle_connections,
            maximum_checkout_time: pool_config.maximum_checkout_time,
            time_to_wait: pool_config.time_to_wait,
            ping_enabled: pool_config.ping_enabled,
            ping_query: pool_config.ping_query.clone(),
            ping_connections_not_used_for: pool_config.ping_connections_not_used_for,
            active_connections: state.active.len(),
            idle_connections: state.idle.len(),
            request_count: state.request_count,
            average_request_time_ms: avg(state.accumulated_request_time_ms, state.request_count),
            average_checkout_time_ms: avg(state.accumulated_checkout_time_ms, state.request_count),
            claimed_overdue_connection_count: state.claimed_overdue_connection_count,
            average_overdue_checkout_time_ms: avg(
                state.accumulated_checkout_time_of_overdue_connections_ms,
                state.claimed_overdue_connection_count,
            ),
            had_to_wait_count: state.had_to_wait_count,
            accumulated_wait_time_ms: state.accumulated_wait_time_ms,
            average_wait_time_ms: avg(state.accumulated_wait_time_ms, state.had_to_wait_count),
            bad_connection_count: state.bad_connection_count,
        }
    }
}

#[async_trait]
impl DataSource for PooledDataSource {
    async fn connection(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.get().await?))
    }

    async fn connection_as(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.get_as(username, password).await?))
    }
}

/// Point-in-time view of the pool for operator diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    /// Configured driver name
    pub driver: String,
    /// Connection URL with the password redacted
    pub url: String,
    /// Configured username
    pub username: Option<String>,
    /// Masked password, present when one is configured
    pub password: Option<String>,
    /// Active-connection cap
    pub maximum_active_connections: usize,
    /// Idle-connection cap
    pub maximum_idle_connections: usize,
    /// Reclaimable checkout duration
    pub maximum_checkout_time: Duration,
    /// Per-cycle wait bound
    pub time_to_wait: Duration,
    /// Whether the probe is enabled
    pub ping_enabled: bool,
    /// Probe SQL
    pub ping_query: String,
    /// Probe idle threshold
    pub ping_connections_not_used_for: Duration,
    /// Connections currently lent out
    pub active_connections: usize,
    /// Connections currently idle
    pub idle_connections: usize,
    /// Borrows served
    pub request_count: u64,
    /// Mean time to serve a borrow
    pub average_request_time_ms: u64,
    /// Mean checkout duration
    pub average_checkout_time_ms: u64,
    /// Overdue borrows reclaimed
    pub claimed_overdue_connection_count: u64,
    /// Mean checkout duration of reclaimed borrows
    pub average_overdue_checkout_time_ms: u64,
    /// Borrows that had to wait at least once
    pub had_to_wait_count: u64,
    /// Total time spent waiting
    pub accumulated_wait_time_ms: u64,
    /// Mean wait per waiting borrow
    pub average_wait_time_ms: u64,
    /// Connections that failed validation
    pub bad_connection_count: u64,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n===CONFIGURATION==============================================")?;
        writeln!(f, " driver                         {}", self.driver)?;
        writeln!(f, " url                            {}", self.url)?;
        writeln!(f, " username                       {}", self.username.as_deref().unwrap_or("NULL"))?;
        writeln!(f, " password                       {}", self.password.as_deref().unwrap_or("NULL"))?;
        writeln!(f, " poolMaxActiveConnections       {}", self.maximum_active_connections)?;
        writeln!(f, " poolMaxIdleConnections         {}", self.maximum_idle_connections)?;
        writeln!(f, " poolMaxCheckoutTime            {}", self.maximum_checkout_time.as_millis())?;
        writeln!(f, " poolTimeToWait                 {}", self.time_to_wait.as_millis())?;
        writeln!(f, " poolPingEnabled                {}", self.ping_enabled)?;
        writeln!(f, " poolPingQuery                  {}", self.ping_query)?;
        writeln!(f, " poolPingConnectionsNotUsedFor  {}", self.ping_connections_not_used_for.as_millis())?;
        writeln!(f, " ---STATUS-----------------------------------------------------")?;
        writeln!(f, " activeConnections              {}", self.active_connections)?;
        writeln!(f, " idleConnections                {}", self.idle_connections)?;
        writeln!(f, " requestCount                   {}", self.request_count)?;
        writeln!(f, " averageRequestTime             {}", self.average_request_time_ms)?;
        writeln!(f, " averageCheckoutTime            {}", self.average_checkout_time_ms)?;
        writeln!(f, " claimedOverdue                 {}", self.claimed_overdue_connection_count)?;
        writeln!(f, " averageOverdueCheckoutTime     {}", self.average_overdue_checkout_time_ms)?;
        writeln!(f, " hadToWait                      {}", self.had_to_wait_count)?;
        writeln!(f, " averageWaitTime                {}", self.average_wait_time_ms)?;
        writeln!(f, " badConnectionCount             {}", self.bad_connection_count)?;
        write!(f, "===============================================================")
    }
}

/// Builds a [`PooledDataSource`] from a string property bag: the unpooled
/// datasource keys plus the `pool*` knobs.
pub struct PooledDataSourceFactory {
    source_config: DataSourceConfig,
    pool_config: PoolConfig,
}

impl PooledDataSourceFactory {
    /// Create a factory with empty source settings and default knobs.
    pub fn new() -> Self {
        Self {
            source_config: DataSourceConfig::default(),
            pool_config: PoolConfig::default(),
        }
    }
}

impl Default for PooledDataSourceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DataSourceFactory for PooledDataSourceFactory {
    fn set_properties(&mut self, properties: &HashMap<String, String>) -> Result<()> {
        let rest = UnpooledDataSourceFactory::apply_properties(&mut self.source_config, properties)?;
        for (key, value) in rest {
            match key.as_str() {
                "poolMaximumActiveConnections" => {
                    self.pool_config.maximum_active_connections = parse_int(&key, &value)?;
                }
                "poolMaximumIdleConnections" => {
                    self.pool_config.maximum_idle_connections = parse_int(&key, &value)?;
                }
                "poolMaximumCheckoutTime" => {
                    self.pool_config.maximum_checkout_time =
                        Duration::from_millis(parse_int(&key, &value)?);
                }
                "poolTimeToWait" => {
                    self.pool_config.time_to_wait = Duration::from_millis(parse_int(&key, &value)?);
                }
                "poolMaximumLocalBadConnectionTolerance" => {
                    self.pool_config.maximum_local_bad_connection_tolerance =
                        parse_int(&key, &value)?;
                }
                "poolPingQuery" => self.pool_config.ping_query = value,
                "poolPingEnabled" => self.pool_config.ping_enabled = parse_bool(&key, &value)?,
                "poolPingConnectionsNotUsedFor" => {
                    self.pool_config.ping_connections_not_used_for =
                        Duration::from_millis(parse_int(&key, &value)?);
                }
                _ => return Err(Error::config(format!("unknown DataSource property: {key}"))),
            }
        }
        Ok(())
    }

    fn data_source(&self) -> Arc<dyn DataSource> {
        Arc::new(PooledDataSource::new(
            self.source_config.clone(),
            self.pool_config.clone(),
        ))
    }
}
