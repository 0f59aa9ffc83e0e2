//! The cache client: key routing, request dispatch and the user-facing
//! command set.
//!
//! Every operation follows the same path: hash the key to its owning
//! server, borrow a connection from that server's pool, enqueue and write
//! the request frames, then wait on the final request's completion signal.
//! A connection whose response timed out or whose write failed is removed
//! from the pool instead of returned, because its positional correlation
//! can no longer be trusted. Multi-key operations batch all requests for
//! one owner as quiet commands terminated by a single replying one.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::connection::{Connection, PooledConnection};
use crate::error::{Error, Result};
use crate::hash_ring::HashRing;
use crate::health::HealthMonitor;
use crate::inflight::{Completion, InflightRequest, ResponsePayload};
use crate::pool::{self, BaseObjectPool, PoolableObjectFactory};
use crate::protocol::{next_opaque, Extras, Opcode, Request};
use crate::server_list::{CacheServerListListener, ServerAddress};
use crate::value::{CacheValue, ValueWithCas};

/// Builds a [`MemcachedClient`].
pub struct Builder {
    name: String,
    servers: Vec<ServerAddress>,
    connect_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    health_check_interval: Option<Duration>,
    failover: bool,
    prefer_remote_config: bool,
    min_connections_per_server: usize,
    max_connections_per_server: usize,
    keep_alive: Option<Duration>,
    allow_disposable_connections: bool,
    borrow_validation: bool,
    return_validation: bool,
}

impl Builder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            servers: Vec::new(),
            connect_timeout: Some(Duration::from_secs(5)),
            write_timeout: Some(Duration::from_secs(5)),
            response_timeout: Some(Duration::from_secs(10)),
            health_check_interval: Some(Duration::from_secs(60)),
            failover: true,
            prefer_remote_config: false,
            min_connections_per_server: 5,
            max_connections_per_server: usize::MAX,
            keep_alive: Some(Duration::from_secs(30 * 60)),
            allow_disposable_connections: false,
            borrow_validation: false,
            return_validation: false,
        }
    }

    pub fn servers(mut self, servers: impl IntoIterator<Item = ServerAddress>) -> Self {
        self.servers = servers.into_iter().collect();
        self
    }

    /// `None` waits forever on connect.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Interval of the failback probe loop. `None` disables the monitor
    /// even when `failover` is on.
    pub fn health_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// When disabled, failing servers are never quarantined or revived.
    pub fn failover(mut self, failover: bool) -> Self {
        self.failover = failover;
        self
    }

    /// Ignore the locally configured server list once the coordination
    /// service publishes one.
    pub fn prefer_remote_config(mut self, prefer: bool) -> Self {
        self.prefer_remote_config = prefer;
        self
    }

    pub fn min_connections_per_server(mut self, min: usize) -> Self {
        self.min_connections_per_server = min;
        self
    }

    pub fn max_connections_per_server(mut self, max: usize) -> Self {
        self.max_connections_per_server = max;
        self
    }

    /// Idle connection lifetime before eviction; `None` keeps them forever.
    pub fn keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Allow over-cap single-use connections when the pool is exhausted.
    pub fn allow_disposable_connections(mut self, allow: bool) -> Self {
        self.allow_disposable_connections = allow;
        self
    }

    /// Probe connections with a `Noop` round-trip when borrowing.
    pub fn borrow_validation(mut self, on: bool) -> Self {
        self.borrow_validation = on;
        self
    }

    /// Probe connections with a `Noop` round-trip when returning.
    pub fn return_validation(mut self, on: bool) -> Self {
        self.return_validation = on;
        self
    }

    /// Construct the client and eagerly open the configured minimum of
    /// connections to every initial server.
    pub async fn build(self) -> MemcachedClient {
        let timeouts = Timeouts {
            connect: self.connect_timeout,
            write: self.write_timeout,
            response: self.response_timeout,
        };
        let factory = Arc::new(ConnectionFactory { timeouts });
        let pool = Arc::new(
            pool::Builder::new(
                factory as Arc<dyn PoolableObjectFactory<ServerAddress, PooledConnection>>,
            )
            .name(format!("{}-connection-pool", self.name))
            .min(self.min_connections_per_server)
            .max(self.max_connections_per_server)
            .keep_alive(self.keep_alive)
            .disposable(self.allow_disposable_connections)
            .borrow_validation(self.borrow_validation)
            .return_validation(self.return_validation)
            .build(),
        );

        let health = match (self.failover, self.health_check_interval) {
            (true, Some(interval)) if !interval.is_zero() => Some((HealthMonitor::new(), interval)),
            _ => None,
        };

        let inner = Arc::new(ClientInner {
            name: self.name,
            timeouts,
            prefer_remote_config: self.prefer_remote_config,
            ring: HashRing::new(),
            servers: Mutex::new(HashSet::new()),
            pool,
            health: health.as_ref().map(|(monitor, _)| monitor.clone()),
        });

        if let Some((monitor, interval)) = health {
            monitor.start(Arc::downgrade(&inner), interval);
        }

        let client = MemcachedClient { inner };
        for address in &self.servers {
            client.inner.add_server_internal(address, true).await;
        }
        client
    }
}

#[derive(Clone, Copy)]
pub(crate) struct Timeouts {
    pub connect: Option<Duration>,
    pub write: Option<Duration>,
    pub response: Option<Duration>,
}

struct ConnectionFactory {
    timeouts: Timeouts,
}

#[async_trait::async_trait]
impl PoolableObjectFactory<ServerAddress, PooledConnection> for ConnectionFactory {
    async fn create(&self, key: &ServerAddress) -> anyhow::Result<PooledConnection> {
        let connection = Connection::connect(key, self.timeouts.connect).await?;
        tracing::debug!(server = %key, connection = connection.id(), "connection established");
        Ok(PooledConnection(connection))
    }

    async fn destroy(&self, key: &ServerAddress, value: PooledConnection) {
        tracing::debug!(server = %key, connection = value.0.id(), "connection destroyed");
        value.0.close();
    }

    async fn validate(&self, _key: &ServerAddress, value: &PooledConnection) -> bool {
        if !value.0.is_open() {
            return false;
        }
        probe(&value.0, Opcode::Noop, self.timeouts).await
    }
}

/// Round-trip a probe request on `connection`; true when the server answers
/// cleanly within the response timeout.
async fn probe(connection: &Arc<Connection>, op: Opcode, timeouts: Timeouts) -> bool {
    let mut request = Request::new(op);
    request.opaque = next_opaque();
    let pending = InflightRequest::new(request, None);
    if let Err(err) = connection.write_batch(&[pending.clone()], timeouts.write).await {
        tracing::debug!(connection = connection.id(), error = %err, "probe write failed");
        return false;
    }
    match pending.await_completion(timeouts.response).await {
        Ok(done) => !done.is_error,
        Err(err) => {
            tracing::debug!(connection = connection.id(), error = %err, "probe failed");
            false
        }
    }
}

/// Guards one dispatch attempt against caller cancellation. If the future
/// driving the attempt is dropped while armed, the borrowed connection has
/// requests in an indeterminate state and is discarded instead of returned.
struct SendAttempt {
    pool: Arc<BaseObjectPool<ServerAddress, PooledConnection>>,
    address: ServerAddress,
    connection: PooledConnection,
    armed: bool,
}

impl SendAttempt {
    fn arm(
        pool: Arc<BaseObjectPool<ServerAddress, PooledConnection>>,
        address: ServerAddress,
        connection: PooledConnection,
    ) -> Self {
        Self { pool, address, connection, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SendAttempt {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let err = Error::Interrupted;
        tracing::debug!(
            server = %self.address,
            connection = self.connection.0.id(),
            error = %err,
            "attempt abandoned by its caller, discarding connection"
        );
        let pool = self.pool.clone();
        let address = self.address.clone();
        let connection = self.connection.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.remove_object(&address, connection).await;
                });
            }
            // No runtime left to run the pool bookkeeping; closing the
            // socket is all that still matters.
            Err(_) => self.connection.0.close(),
        }
    }
}

pub(crate) struct ClientInner {
    name: String,
    timeouts: Timeouts,
    prefer_remote_config: bool,
    ring: HashRing,
    servers: Mutex<HashSet<ServerAddress>>,
    pool: Arc<BaseObjectPool<ServerAddress, PooledConnection>>,
    health: Option<Arc<HealthMonitor>>,
}

impl ClientInner {
    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        self.timeouts.connect
    }

    /// Version-command probe used by the health monitor on its untracked
    /// connections.
    pub(crate) async fn probe_version(&self, connection: &Arc<Connection>) -> bool {
        probe(connection, Opcode::Version, self.timeouts).await
    }

    /// Add a server to the ring and pre-open its minimum connections.
    ///
    /// In initial mode a failing server is still added to the ring so the
    /// health monitor can revive it later; in non-initial (revival) mode the
    /// add is rolled back and reported.
    pub(crate) async fn add_server_internal(&self, address: &ServerAddress, initial: bool) -> bool {
        if let Err(err) = self.pool.create_all_min_objects(address).await {
            tracing::error!(server = %address, error = %err, "failed to open minimum connections");
            self.pool.destroy(address).await;
            if !initial {
                return false;
            }
        }
        self.ring.add(address);
        self.servers.lock().unwrap().insert(address.clone());
        tracing::info!(server = %address, ring_size = self.ring.len(), "server added to the ring");
        true
    }

    /// Remove a server. A forcible removal always takes effect; a
    /// health-mediated one only when the monitor newly quarantines the
    /// server (and does nothing when failover is disabled).
    pub(crate) async fn remove_server_internal(&self, address: &ServerAddress, forcibly: bool) {
        let drop_from_ring = if forcibly {
            true
        } else {
            match &self.health {
                Some(monitor) => monitor.mark_failure(address),
                None => false,
            }
        };
        if drop_from_ring {
            self.ring.remove(address);
            self.servers.lock().unwrap().remove(address);
            tracing::info!(server = %address, forcibly, "server removed from the ring");
        }
        self.pool.destroy(address).await;
    }

    /// Borrow, write and await the terminal request of `batch`.
    ///
    /// The returned completion is the terminal request's; earlier batch
    /// members have had their result slots populated and are collated by
    /// the caller.
    pub(crate) async fn send_internal(
        &self,
        address: &ServerAddress,
        batch: &[Arc<InflightRequest>],
    ) -> Result<Completion> {
        let Some(last) = batch.last() else {
            return Err(Error::Unsupported("empty request batch"));
        };
        for item in batch {
            if matches!(
                item.request.op,
                Opcode::SaslListMechs | Opcode::SaslAuth | Opcode::SaslStep
            ) {
                return Err(Error::Unsupported("SASL authentication"));
            }
        }

        let connection = match self.pool.borrow_object(address, self.timeouts.connect).await {
            Ok(connection) => connection,
            Err(err) => {
                if matches!(err, Error::NoValidObject { .. } | Error::CreateFailed { .. }) {
                    // The pool cannot produce a working connection to this
                    // server; hand it to the health monitor.
                    self.remove_server_internal(address, false).await;
                }
                return Err(err);
            }
        };
        let attempt = SendAttempt::arm(self.pool.clone(), address.clone(), connection.clone());

        if let Err(err) = connection.0.write_batch(batch, self.timeouts.write).await {
            attempt.disarm();
            self.pool.remove_object(address, connection).await;
            return Err(err);
        }

        match last.await_completion(self.timeouts.response).await {
            Ok(done) => {
                attempt.disarm();
                self.return_connection_safely(address, connection).await;
                Ok(done)
            }
            Err(err) => {
                attempt.disarm();
                // A timed-out response will still arrive eventually and
                // would desynchronize positional correlation.
                if err.poisons_connection() {
                    self.pool.remove_object(address, connection).await;
                } else {
                    self.return_connection_safely(address, connection).await;
                }
                Err(err)
            }
        }
    }

    /// Write a quiet request without waiting for any response. The request
    /// completes on write success; a failed write removes the connection.
    pub(crate) async fn send_no_reply(
        &self,
        address: &ServerAddress,
        pending: Arc<InflightRequest>,
    ) -> Result<()> {
        let connection = match self.pool.borrow_object(address, self.timeouts.connect).await {
            Ok(connection) => connection,
            Err(err) => {
                if matches!(err, Error::NoValidObject { .. } | Error::CreateFailed { .. }) {
                    self.remove_server_internal(address, false).await;
                }
                return Err(err);
            }
        };
        let attempt = SendAttempt::arm(self.pool.clone(), address.clone(), connection.clone());
        if !pending.quiet {
            // Nothing sensible to do with a replying request here; put the
            // connection back untouched.
            tracing::warn!(op = ?pending.request.op, "send_no_reply called with a replying request");
            attempt.disarm();
            self.return_connection_safely(address, connection).await;
            return Ok(());
        }
        match connection.0.write_batch(&[pending], self.timeouts.write).await {
            Ok(()) => {
                attempt.disarm();
                self.return_connection_safely(address, connection).await;
                Ok(())
            }
            Err(err) => {
                attempt.disarm();
                self.pool.remove_object(address, connection).await;
                Err(err)
            }
        }
    }

    async fn return_connection_safely(&self, address: &ServerAddress, connection: PooledConnection) {
        if connection.0.is_open() {
            self.pool.return_object(address, connection).await;
        } else {
            self.pool.remove_object(address, connection).await;
        }
    }

    fn owner_of(&self, key: &[u8]) -> Result<ServerAddress> {
        self.ring.get(key).ok_or(Error::NoServer)
    }

    /// Route a single replying request by its key and return the completion.
    async fn round_trip(&self, request: Request, origin_key: Bytes) -> Result<Completion> {
        let address = self.owner_of(&origin_key)?;
        let pending = InflightRequest::new(request, Some(origin_key));
        self.send_internal(&address, std::slice::from_ref(&pending)).await
    }
}

/// Multi-server memcached client. Cheap to clone; all clones share the
/// same pools, ring and health monitor.
#[derive(Clone)]
pub struct MemcachedClient {
    inner: Arc<ClientInner>,
}

impl MemcachedClient {
    pub fn builder(name: impl Into<String>) -> Builder {
        Builder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a server to the routing ring, opening its minimum connections.
    pub async fn add_server(&self, address: &ServerAddress) -> bool {
        self.inner.add_server_internal(address, true).await
    }

    /// Forcibly remove a server from the ring and destroy its pool entry.
    pub async fn remove_server(&self, address: &ServerAddress) {
        self.inner.remove_server_internal(address, true).await;
    }

    pub fn contains_server(&self, address: &ServerAddress) -> bool {
        self.inner.ring.contains(address)
    }

    pub fn current_server_list(&self) -> Vec<ServerAddress> {
        let mut servers: Vec<ServerAddress> =
            self.inner.servers.lock().unwrap().iter().cloned().collect();
        servers.sort();
        servers
    }

    /// Listener to hand to a coordination-service client so published
    /// server lists drive ring membership.
    pub fn server_list_listener(&self) -> CacheServerListListener {
        let local: HashSet<ServerAddress> =
            self.inner.servers.lock().unwrap().iter().cloned().collect();
        CacheServerListListener::new(self.clone(), local, self.inner.prefer_remote_config)
    }

    /// Per-server pool observers; −1 when the server has no pool entry.
    pub fn pool_size(&self, address: &ServerAddress) -> i64 {
        self.inner.pool.pool_size(address)
    }

    pub fn active_connection_count(&self, address: &ServerAddress) -> i64 {
        self.inner.pool.active_count(address)
    }

    pub fn idle_connection_count(&self, address: &ServerAddress) -> i64 {
        self.inner.pool.idle_count(address)
    }

    pub fn peak_connection_count(&self, address: &ServerAddress) -> i64 {
        self.inner.pool.peak_count(address)
    }

    /// Stop the health monitor, clear the ring and close every connection.
    pub async fn shutdown(&self) {
        if let Some(monitor) = &self.inner.health {
            monitor.stop();
        }
        self.inner.servers.lock().unwrap().clear();
        self.inner.ring.clear();
        self.inner.pool.destroy_all().await;
        tracing::info!(client = %self.inner.name, "client shut down");
    }

    // ----- single-key commands -------------------------------------------

    /// Store a value regardless of any existing entry.
    pub async fn set<V: CacheValue>(
        &self,
        key: impl AsRef<[u8]>,
        value: &V,
        expiration_secs: u32,
        no_reply: bool,
    ) -> bool {
        self.store(Opcode::Set, Opcode::SetQ, key, value, expiration_secs, 0, no_reply).await
    }

    /// Store only when the key does not exist.
    pub async fn add<V: CacheValue>(
        &self,
        key: impl AsRef<[u8]>,
        value: &V,
        expiration_secs: u32,
        no_reply: bool,
    ) -> bool {
        self.store(Opcode::Add, Opcode::AddQ, key, value, expiration_secs, 0, no_reply).await
    }

    /// Store only when the key already exists.
    pub async fn replace<V: CacheValue>(
        &self,
        key: impl AsRef<[u8]>,
        value: &V,
        expiration_secs: u32,
        no_reply: bool,
    ) -> bool {
        self.store(Opcode::Replace, Opcode::ReplaceQ, key, value, expiration_secs, 0, no_reply)
            .await
    }

    /// Compare-and-swap store; succeeds only when `cas` still matches.
    pub async fn cas<V: CacheValue>(
        &self,
        key: impl AsRef<[u8]>,
        value: &V,
        expiration_secs: u32,
        cas: u64,
        no_reply: bool,
    ) -> bool {
        self.store(Opcode::Set, Opcode::SetQ, key, value, expiration_secs, cas, no_reply).await
    }

    pub async fn append<V: CacheValue>(&self, key: impl AsRef<[u8]>, value: &V, no_reply: bool) -> bool {
        self.concat(Opcode::Append, Opcode::AppendQ, key, value, no_reply).await
    }

    pub async fn prepend<V: CacheValue>(&self, key: impl AsRef<[u8]>, value: &V, no_reply: bool) -> bool {
        self.concat(Opcode::Prepend, Opcode::PrependQ, key, value, no_reply).await
    }

    /// Fetch a value, or `None` on a miss or any failure.
    pub async fn get<V: CacheValue>(&self, key: impl AsRef<[u8]>) -> Option<V> {
        let origin = Bytes::copy_from_slice(key.as_ref());
        let mut request = Request::new(Opcode::Get);
        request.key = Some(origin.clone());
        match self.inner.round_trip(request, origin).await {
            Ok(done) => {
                decode_value(done).and_then(|(flags, data, _cas)| data_to_value(flags, data))
            }
            Err(err) => {
                log_command_failure("get", &err);
                None
            }
        }
    }

    /// Fetch a value together with its CAS token.
    pub async fn gets<V: CacheValue>(&self, key: impl AsRef<[u8]>) -> Option<ValueWithCas<V>> {
        let origin = Bytes::copy_from_slice(key.as_ref());
        let mut request = Request::new(Opcode::Gets);
        request.key = Some(origin.clone());
        match self.inner.round_trip(request, origin).await {
            Ok(done) => decode_value(done).and_then(|(flags, data, cas)| {
                data_to_value(flags, data).map(|value| ValueWithCas { value, cas })
            }),
            Err(err) => {
                log_command_failure("gets", &err);
                None
            }
        }
    }

    pub async fn delete(&self, key: impl AsRef<[u8]>, no_reply: bool) -> bool {
        let origin = Bytes::copy_from_slice(key.as_ref());
        let op = if no_reply { Opcode::DeleteQ } else { Opcode::Delete };
        let mut request = Request::new(op);
        request.key = Some(origin.clone());
        if no_reply {
            request.opaque = next_opaque();
            return self.fire_and_forget(request, origin).await;
        }
        match self.inner.round_trip(request, origin).await {
            Ok(done) => !done.is_error,
            Err(err) => {
                log_command_failure("delete", &err);
                false
            }
        }
    }

    /// Increment a counter, creating it at `initial` when absent. Returns
    /// −1 on failure and under `no_reply`, where the new value is unknown.
    pub async fn incr(
        &self,
        key: impl AsRef<[u8]>,
        delta: u64,
        initial: u64,
        expiration_secs: u32,
        no_reply: bool,
    ) -> i64 {
        self.counter(Opcode::Increment, Opcode::IncrementQ, key, delta, initial, expiration_secs, no_reply)
            .await
    }

    /// Decrement a counter (floored at zero by the server). Returns −1 on
    /// failure and under `no_reply`.
    pub async fn decr(
        &self,
        key: impl AsRef<[u8]>,
        delta: u64,
        initial: u64,
        expiration_secs: u32,
        no_reply: bool,
    ) -> i64 {
        self.counter(Opcode::Decrement, Opcode::DecrementQ, key, delta, initial, expiration_secs, no_reply)
            .await
    }

    /// Update an entry's expiration without touching its value.
    pub async fn touch(&self, key: impl AsRef<[u8]>, expiration_secs: u32) -> bool {
        let origin = Bytes::copy_from_slice(key.as_ref());
        let mut request = Request::new(Opcode::Touch);
        request.key = Some(origin.clone());
        request.extras = Extras::Expiration(expiration_secs);
        match self.inner.round_trip(request, origin).await {
            Ok(done) => !done.is_error,
            Err(err) => {
                log_command_failure("touch", &err);
                false
            }
        }
    }

    /// Get and simultaneously re-touch an entry.
    pub async fn gat<V: CacheValue>(&self, key: impl AsRef<[u8]>, expiration_secs: u32) -> Option<V> {
        let origin = Bytes::copy_from_slice(key.as_ref());
        let mut request = Request::new(Opcode::Gat);
        request.key = Some(origin.clone());
        request.extras = Extras::Expiration(expiration_secs);
        match self.inner.round_trip(request, origin).await {
            Ok(done) => {
                decode_value(done).and_then(|(flags, data, _cas)| data_to_value(flags, data))
            }
            Err(err) => {
                log_command_failure("gat", &err);
                None
            }
        }
    }

    // ----- multi-key commands --------------------------------------------

    /// Fetch many keys at once. Absent, failed and unroutable keys are
    /// omitted from the result.
    pub async fn get_multi<K, V>(&self, keys: &[K]) -> HashMap<K, V>
    where
        K: AsRef<[u8]> + Eq + Hash + Clone,
        V: CacheValue,
    {
        let mut result = HashMap::new();
        for (address, owned) in self.partition_keys(keys) {
            let batch = build_get_batch(&owned, Opcode::Get, Opcode::GetQ);
            match self.inner.send_internal(&address, &batch_requests(&batch)).await {
                Ok(_) => collate_values(&batch, &mut result),
                Err(err) => {
                    tracing::error!(server = %address, error = %err, "get_multi batch failed");
                }
            }
        }
        result
    }

    /// `get_multi` variant that also returns CAS tokens.
    pub async fn gets_multi<K, V>(&self, keys: &[K]) -> HashMap<K, ValueWithCas<V>>
    where
        K: AsRef<[u8]> + Eq + Hash + Clone,
        V: CacheValue,
    {
        let mut result = HashMap::new();
        for (address, owned) in self.partition_keys(keys) {
            let batch = build_get_batch(&owned, Opcode::Gets, Opcode::GetsQ);
            match self.inner.send_internal(&address, &batch_requests(&batch)).await {
                Ok(_) => {
                    for (key, pending) in &batch {
                        let Some(done) = pending.try_result() else { continue };
                        if let Some((flags, data, cas)) = decode_value(done) {
                            if let Some(value) = data_to_value(flags, data) {
                                result.insert(key.clone(), ValueWithCas { value, cas });
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(server = %address, error = %err, "gets_multi batch failed");
                }
            }
        }
        result
    }

    /// Store many entries. The result maps each stored key to `true`;
    /// failed keys are absent.
    pub async fn set_multi<K, V>(&self, entries: &HashMap<K, V>, expiration_secs: u32) -> HashMap<K, bool>
    where
        K: AsRef<[u8]> + Eq + Hash + Clone,
        V: CacheValue,
    {
        let keys: Vec<K> = entries.keys().cloned().collect();
        let mut result = HashMap::new();
        for (address, owned) in self.partition_keys(&keys) {
            let batch: Vec<(K, Arc<InflightRequest>)> = owned
                .iter()
                .enumerate()
                .map(|(index, key)| {
                    let origin = Bytes::copy_from_slice(key.as_ref());
                    let terminal = index == owned.len() - 1;
                    let (flags, data) = entries[key].encode();
                    let mut request = Request::new(if terminal { Opcode::Set } else { Opcode::SetQ });
                    if !terminal {
                        request.opaque = next_opaque();
                    }
                    request.key = Some(origin.clone());
                    request.value = Some(data);
                    request.extras = Extras::Store { flags, expiration: expiration_secs };
                    (key.clone(), InflightRequest::new(request, Some(origin)))
                })
                .collect();
            match self.inner.send_internal(&address, &batch_requests(&batch)).await {
                Ok(_) => collate_successes(&batch, &mut result),
                Err(err) => {
                    tracing::error!(server = %address, error = %err, "set_multi batch failed");
                }
            }
        }
        result
    }

    /// Compare-and-swap many entries at once. Stores ride `Set`/`SetQ`
    /// frames with a non-zero CAS header, which the server honors like a
    /// dedicated CAS command.
    pub async fn cas_multi<K, V>(
        &self,
        entries: &HashMap<K, ValueWithCas<V>>,
        expiration_secs: u32,
    ) -> HashMap<K, bool>
    where
        K: AsRef<[u8]> + Eq + Hash + Clone,
        V: CacheValue,
    {
        let keys: Vec<K> = entries.keys().cloned().collect();
        let mut result = HashMap::new();
        for (address, owned) in self.partition_keys(&keys) {
            let batch: Vec<(K, Arc<InflightRequest>)> = owned
                .iter()
                .enumerate()
                .map(|(index, key)| {
                    let origin = Bytes::copy_from_slice(key.as_ref());
                    let terminal = index == owned.len() - 1;
                    let stored = &entries[key];
                    let (flags, data) = stored.value.encode();
                    let mut request = Request::new(if terminal { Opcode::Set } else { Opcode::SetQ });
                    if !terminal {
                        request.opaque = next_opaque();
                    }
                    request.cas = stored.cas;
                    request.key = Some(origin.clone());
                    request.value = Some(data);
                    request.extras = Extras::Store { flags, expiration: expiration_secs };
                    (key.clone(), InflightRequest::new(request, Some(origin)))
                })
                .collect();
            match self.inner.send_internal(&address, &batch_requests(&batch)).await {
                Ok(_) => collate_successes(&batch, &mut result),
                Err(err) => {
                    tracing::error!(server = %address, error = %err, "cas_multi batch failed");
                }
            }
        }
        result
    }

    /// Delete many keys. Deleted keys map to `true`; failures are absent.
    pub async fn delete_multi<K>(&self, keys: &[K]) -> HashMap<K, bool>
    where
        K: AsRef<[u8]> + Eq + Hash + Clone,
    {
        let mut result = HashMap::new();
        for (address, owned) in self.partition_keys(keys) {
            let batch: Vec<(K, Arc<InflightRequest>)> = owned
                .iter()
                .enumerate()
                .map(|(index, key)| {
                    let origin = Bytes::copy_from_slice(key.as_ref());
                    let terminal = index == owned.len() - 1;
                    let mut request =
                        Request::new(if terminal { Opcode::Delete } else { Opcode::DeleteQ });
                    if !terminal {
                        request.opaque = next_opaque();
                    }
                    request.key = Some(origin.clone());
                    (key.clone(), InflightRequest::new(request, Some(origin)))
                })
                .collect();
            match self.inner.send_internal(&address, &batch_requests(&batch)).await {
                Ok(_) => collate_successes(&batch, &mut result),
                Err(err) => {
                    tracing::error!(server = %address, error = %err, "delete_multi batch failed");
                }
            }
        }
        result
    }

    // ----- per-server commands -------------------------------------------

    /// Server version string, or `None` on failure.
    pub async fn version(&self, address: &ServerAddress) -> Option<String> {
        let request = Request::new(Opcode::Version);
        let pending = InflightRequest::new(request, None);
        match self.inner.send_internal(address, std::slice::from_ref(&pending)).await {
            Ok(done) => match done.payload {
                ResponsePayload::Frame { value: Some(data), .. } if !done.is_error => {
                    String::from_utf8(data.to_vec()).ok()
                }
                _ => None,
            },
            Err(err) => {
                log_command_failure("version", &err);
                None
            }
        }
    }

    /// Collated statistics from one server.
    pub async fn stats(&self, address: &ServerAddress) -> HashMap<String, String> {
        let request = Request::new(Opcode::Stat);
        let pending = InflightRequest::new(request, None);
        match self.inner.send_internal(address, std::slice::from_ref(&pending)).await {
            Ok(done) => match done.payload {
                ResponsePayload::Stats(entries) if !done.is_error => entries
                    .into_iter()
                    .filter_map(|(key, value)| {
                        Some((
                            String::from_utf8(key.to_vec()).ok()?,
                            String::from_utf8(value.to_vec()).ok()?,
                        ))
                    })
                    .collect(),
                _ => HashMap::new(),
            },
            Err(err) => {
                log_command_failure("stats", &err);
                HashMap::new()
            }
        }
    }

    pub async fn noop(&self, address: &ServerAddress) -> bool {
        let pending = InflightRequest::new(Request::new(Opcode::Noop), None);
        match self.inner.send_internal(address, std::slice::from_ref(&pending)).await {
            Ok(done) => !done.is_error,
            Err(err) => {
                log_command_failure("noop", &err);
                false
            }
        }
    }

    pub async fn verbosity(&self, address: &ServerAddress, level: u32) -> bool {
        let mut request = Request::new(Opcode::Verbosity);
        request.extras = Extras::Verbosity(level);
        let pending = InflightRequest::new(request, None);
        match self.inner.send_internal(address, std::slice::from_ref(&pending)).await {
            Ok(done) => !done.is_error,
            Err(err) => {
                log_command_failure("verbosity", &err);
                false
            }
        }
    }

    /// Flush one server, optionally delayed. True when the server accepted.
    pub async fn flush(&self, address: &ServerAddress, delay_secs: u32) -> bool {
        let mut request = Request::new(Opcode::Flush);
        if delay_secs > 0 {
            request.extras = Extras::Expiration(delay_secs);
        }
        let pending = InflightRequest::new(request, None);
        match self.inner.send_internal(address, std::slice::from_ref(&pending)).await {
            Ok(done) => !done.is_error,
            Err(err) => {
                log_command_failure("flush", &err);
                false
            }
        }
    }

    /// Flush every server in the current list; true when all accepted.
    pub async fn flush_all(&self, delay_secs: u32) -> bool {
        let mut all_ok = true;
        for address in self.current_server_list() {
            all_ok &= self.flush(&address, delay_secs).await;
        }
        all_ok
    }

    /// Ask one server to close the session. The local connection is
    /// discarded afterwards since the server will drop it.
    pub async fn quit(&self, address: &ServerAddress) -> bool {
        let pending = InflightRequest::new(Request::new(Opcode::Quit), None);
        let ok = match self.inner.send_internal(address, std::slice::from_ref(&pending)).await {
            Ok(done) => !done.is_error,
            Err(err) => {
                log_command_failure("quit", &err);
                false
            }
        };
        self.inner.pool.remove_all_objects(address).await;
        ok
    }

    // ----- shared command plumbing ---------------------------------------

    async fn store<V: CacheValue>(
        &self,
        op: Opcode,
        quiet_op: Opcode,
        key: impl AsRef<[u8]>,
        value: &V,
        expiration_secs: u32,
        cas: u64,
        no_reply: bool,
    ) -> bool {
        let origin = Bytes::copy_from_slice(key.as_ref());
        let (flags, data) = value.encode();
        let mut request = Request::new(if no_reply { quiet_op } else { op });
        request.cas = cas;
        request.key = Some(origin.clone());
        request.value = Some(data);
        request.extras = Extras::Store { flags, expiration: expiration_secs };
        if no_reply {
            request.opaque = next_opaque();
            return self.fire_and_forget(request, origin).await;
        }
        match self.inner.round_trip(request, origin).await {
            Ok(done) => !done.is_error,
            Err(err) => {
                log_command_failure("store", &err);
                false
            }
        }
    }

    async fn concat<V: CacheValue>(
        &self,
        op: Opcode,
        quiet_op: Opcode,
        key: impl AsRef<[u8]>,
        value: &V,
        no_reply: bool,
    ) -> bool {
        let origin = Bytes::copy_from_slice(key.as_ref());
        let (_flags, data) = value.encode();
        let mut request = Request::new(if no_reply { quiet_op } else { op });
        request.key = Some(origin.clone());
        request.value = Some(data);
        if no_reply {
            request.opaque = next_opaque();
            return self.fire_and_forget(request, origin).await;
        }
        match self.inner.round_trip(request, origin).await {
            Ok(done) => !done.is_error,
            Err(err) => {
                log_command_failure("concat", &err);
                false
            }
        }
    }

    async fn counter(
        &self,
        op: Opcode,
        quiet_op: Opcode,
        key: impl AsRef<[u8]>,
        delta: u64,
        initial: u64,
        expiration_secs: u32,
        no_reply: bool,
    ) -> i64 {
        let origin = Bytes::copy_from_slice(key.as_ref());
        let mut request = Request::new(if no_reply { quiet_op } else { op });
        request.key = Some(origin.clone());
        request.extras = Extras::Counter { delta, initial, expiration: expiration_secs };
        if no_reply {
            // The new counter value is unobservable without a response.
            request.opaque = next_opaque();
            self.fire_and_forget(request, origin).await;
            return -1;
        }
        match self.inner.round_trip(request, origin).await {
            Ok(done) => match done.payload {
                ResponsePayload::Frame { value: Some(data), .. }
                    if !done.is_error && data.len() == 8 =>
                {
                    u64::from_be_bytes(data[..8].try_into().unwrap()) as i64
                }
                _ => -1,
            },
            Err(err) => {
                log_command_failure("counter", &err);
                -1
            }
        }
    }

    async fn fire_and_forget(&self, request: Request, origin: Bytes) -> bool {
        let address = match self.inner.owner_of(&origin) {
            Ok(address) => address,
            Err(err) => {
                log_command_failure("no_reply", &err);
                return false;
            }
        };
        let pending = InflightRequest::new(request, Some(origin));
        match self.inner.send_no_reply(&address, pending).await {
            Ok(()) => true,
            Err(err) => {
                log_command_failure("no_reply", &err);
                false
            }
        }
    }

    fn partition_keys<K>(&self, keys: &[K]) -> HashMap<ServerAddress, Vec<K>>
    where
        K: AsRef<[u8]> + Clone,
    {
        let mut by_server: HashMap<ServerAddress, Vec<K>> = HashMap::new();
        for key in keys {
            match self.inner.ring.get(key.as_ref()) {
                Some(address) => by_server.entry(address).or_default().push(key.clone()),
                None => {
                    // An empty ring silently drops the key from the result.
                    tracing::warn!("no server owns key; omitted from multi operation");
                }
            }
        }
        by_server
    }
}

fn build_get_batch<K>(keys: &[K], terminal_op: Opcode, quiet_op: Opcode) -> Vec<(K, Arc<InflightRequest>)>
where
    K: AsRef<[u8]> + Clone,
{
    keys.iter()
        .enumerate()
        .map(|(index, key)| {
            let origin = Bytes::copy_from_slice(key.as_ref());
            let terminal = index == keys.len() - 1;
            let mut request = Request::new(if terminal { terminal_op } else { quiet_op });
            if !terminal {
                request.opaque = next_opaque();
            }
            request.key = Some(origin.clone());
            (key.clone(), InflightRequest::new(request, Some(origin)))
        })
        .collect()
}

fn batch_requests<K>(batch: &[(K, Arc<InflightRequest>)]) -> Vec<Arc<InflightRequest>> {
    batch.iter().map(|(_, pending)| pending.clone()).collect()
}

fn collate_values<K, V>(batch: &[(K, Arc<InflightRequest>)], result: &mut HashMap<K, V>)
where
    K: Eq + Hash + Clone,
    V: CacheValue,
{
    for (key, pending) in batch {
        let Some(done) = pending.try_result() else { continue };
        if let Some((flags, data, _cas)) = decode_value(done) {
            if let Some(value) = data_to_value(flags, data) {
                result.insert(key.clone(), value);
            }
        }
    }
}

fn collate_successes<K>(batch: &[(K, Arc<InflightRequest>)], result: &mut HashMap<K, bool>)
where
    K: Eq + Hash + Clone,
{
    for (key, pending) in batch {
        let Some(done) = pending.try_result() else { continue };
        if !done.is_error {
            result.insert(key.clone(), true);
        }
    }
}

/// Extract `(flags, data, cas)` from a successful value-bearing completion.
fn decode_value(done: Completion) -> Option<(u32, Bytes, u64)> {
    if done.is_error {
        if let ResponsePayload::Frame { status, .. } = done.payload {
            tracing::debug!(status = status.as_u16(), "server reported error status");
        }
        return None;
    }
    match done.payload {
        ResponsePayload::Frame { flags, cas, value, .. } => Some((flags, value.unwrap_or_default(), cas)),
        // A skipped quiet get means the server had nothing to say: a miss.
        _ => None,
    }
}

fn data_to_value<V: CacheValue>(flags: u32, data: Bytes) -> Option<V> {
    match V::decode(flags, data) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(error = %err, "failed to decode cached value");
            None
        }
    }
}

fn log_command_failure(command: &str, err: &Error) {
    match err {
        Error::NoServer => {
            tracing::debug!(command, error = %err, "command failed");
        }
        _ => {
            tracing::error!(command, error = %err, "command failed");
        }
    }
}
