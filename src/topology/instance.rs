//! One physical server, its connection pool and what its last handshake said.
use {Error, Result};
use Error::OperationError;

use apm::ServerEvent;
use auth::AuthContext;
use connection::Connection;
use connstring::ServerAddress;
use pool::{AcquireOptions, ConnectionPool, PooledConnection};
use queue::HandoffQueue;
use topology::ServerContext;
use topology::handshake::IsMasterResult;
use topology::ping::PingTimeAggregator;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

static NEXT_SEQUENTIAL_ID: AtomicUsize = AtomicUsize::new(1);

/// The connection state of a single instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// A connection failed since the last verification; the instance must be
    /// verified before it is used again.
    Unknown,
}

/// The role an instance reported in its handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstanceType {
    Unknown,
    Standalone,
    ReplicaSetMember,
    ShardRouter,
}

/// What a replica set member reported about its set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaSetInformation {
    pub name: String,
    pub primary: Option<ServerAddress>,
    /// Hosts, passives and arbiters.
    pub members: Vec<ServerAddress>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
struct ServerInformation {
    instance_type: InstanceType,
    is_primary: bool,
    is_secondary: bool,
    is_arbiter: bool,
    is_passive: bool,
    is_master_result: Option<IsMasterResult>,
    replica_set: Option<ReplicaSetInformation>,
}

impl ServerInformation {
    fn unknown() -> ServerInformation {
        ServerInformation {
            instance_type: InstanceType::Unknown,
            is_primary: false,
            is_secondary: false,
            is_arbiter: false,
            is_passive: false,
            is_master_result: None,
            replica_set: None,
        }
    }

    fn from_is_master(result: IsMasterResult) -> ServerInformation {
        let instance_type = result.instance_type();
        let replica_set = if instance_type == InstanceType::ReplicaSetMember {
            Some(ReplicaSetInformation {
                name: result.set_name.clone().unwrap_or_default(),
                primary: result.primary.clone(),
                members: result.members(),
                tags: result.tags.clone(),
            })
        } else {
            None
        };

        ServerInformation {
            instance_type: instance_type,
            is_primary: result.is_master,
            is_secondary: result.is_secondary,
            is_arbiter: result.arbiter_only,
            is_passive: result.passive,
            is_master_result: Some(result),
            replica_set: replica_set,
        }
    }

    // Keeps the role and set description, which are likely still right, but
    // drops every claim about the instance's current standing.
    fn failed(&self, result: Option<IsMasterResult>) -> ServerInformation {
        ServerInformation {
            instance_type: self.instance_type,
            is_primary: false,
            is_secondary: false,
            is_arbiter: false,
            is_passive: false,
            is_master_result: result,
            replica_set: self.replica_set.clone(),
        }
    }
}

struct InstanceInner {
    address: ServerAddress,
    state: ServerState,
    info: ServerInformation,
    connect_error: Option<Arc<Error>>,
    permanently_disconnected: bool,
}

/// A physical server known to a proxy.
///
/// Every state transition is logged, reported to the listener and pushed
/// onto the subscribed handoff queue, if any. The instance lock is never
/// held while the pool, the queue or the listener is called.
pub struct ServerInstance {
    me: Weak<ServerInstance>,
    sequential_id: usize,
    context: Arc<ServerContext>,
    pool: ConnectionPool,
    ping_times: PingTimeAggregator,
    inner: Mutex<InstanceInner>,
    events: Mutex<Option<Arc<HandoffQueue<Arc<ServerInstance>>>>>,
}

impl fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ServerInstance")
            .field("sequential_id", &self.sequential_id)
            .field("address", &inner.address)
            .field("state", &inner.state)
            .field("instance_type", &inner.info.instance_type)
            .finish()
    }
}

impl ServerInstance {
    pub fn new(address: ServerAddress, context: Arc<ServerContext>) -> Arc<ServerInstance> {
        Arc::new_cyclic(|me| {
            ServerInstance {
                me: me.clone(),
                sequential_id: NEXT_SEQUENTIAL_ID.fetch_add(1, Ordering::SeqCst),
                pool: ConnectionPool::new(me.clone(), context.clone()),
                ping_times: PingTimeAggregator::new(context.settings.ping_window_size),
                context: context,
                inner: Mutex::new(InstanceInner {
                    address: address,
                    state: ServerState::Disconnected,
                    info: ServerInformation::unknown(),
                    connect_error: None,
                    permanently_disconnected: false,
                }),
                events: Mutex::new(None),
            }
        })
    }

    fn lock(&self) -> MutexGuard<InstanceInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A process-wide unique id, used in log lines.
    pub fn sequential_id(&self) -> usize {
        self.sequential_id
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn address(&self) -> ServerAddress {
        self.lock().address.clone()
    }

    // Adopts the canonical address reported by the server.
    pub(crate) fn set_address(&self, address: ServerAddress) {
        let mut inner = self.lock();
        if inner.address != address {
            info!("server instance {} is now known as {} (was {})",
                  self.sequential_id,
                  address,
                  inner.address);
            inner.address = address;
        }
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    pub fn instance_type(&self) -> InstanceType {
        self.lock().info.instance_type
    }

    pub fn is_primary(&self) -> bool {
        self.lock().info.is_primary
    }

    pub fn is_secondary(&self) -> bool {
        self.lock().info.is_secondary
    }

    pub fn is_arbiter(&self) -> bool {
        self.lock().info.is_arbiter
    }

    pub fn is_passive(&self) -> bool {
        self.lock().info.is_passive
    }

    pub fn is_master_result(&self) -> Option<IsMasterResult> {
        self.lock().info.is_master_result.clone()
    }

    pub fn replica_set_information(&self) -> Option<ReplicaSetInformation> {
        self.lock().info.replica_set.clone()
    }

    /// The replica set tags of this member; empty for other instance types.
    pub fn tags(&self) -> BTreeMap<String, String> {
        self.lock().info.replica_set.as_ref().map(|rs| rs.tags.clone()).unwrap_or_default()
    }

    pub fn average_ping_time(&self) -> Duration {
        self.ping_times.average()
    }

    /// The error recorded by the last failed connect. Cleared once a connect
    /// succeeds.
    pub fn connect_error(&self) -> Option<Arc<Error>> {
        self.lock().connect_error.clone()
    }

    pub(crate) fn set_connect_error(&self, err: Error) {
        self.lock().connect_error = Some(Arc::new(err));
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        self.lock().permanently_disconnected
    }

    /// Pushes this instance onto `queue` on every future state change.
    pub fn subscribe(&self, queue: Arc<HandoffQueue<Arc<ServerInstance>>>) {
        match self.events.lock() {
            Ok(mut events) => *events = Some(queue),
            Err(poisoned) => *poisoned.into_inner() = Some(queue),
        }
    }

    pub fn unsubscribe(&self) {
        match self.events.lock() {
            Ok(mut events) => *events = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    fn on_state_changed(&self) {
        self.on_changed(true);
    }

    // Reports a change. The proxy is told about every change, listeners
    // only about state transitions.
    fn on_changed(&self, state_changed: bool) {
        if state_changed {
            let (address, state) = {
                let inner = self.lock();
                (inner.address.clone(), inner.state)
            };

            debug!("server instance {} ({}) is now {:?}", self.sequential_id, address, state);
            self.context.listener.emit(&ServerEvent::InstanceStateChanged {
                address: address,
                state: state,
            });
        }

        let sink = match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        if let (Some(queue), Some(me)) = (sink, self.me.upgrade()) {
            queue.enqueue(me);
        }
    }

    /// Moves to `state`, reporting the change if it is one.
    pub fn set_state(&self, state: ServerState) {
        {
            let mut inner = self.lock();
            if inner.state == state {
                return;
            }
            inner.state = state;
        }

        self.on_state_changed();
    }

    fn set_state_and_info(&self, state: ServerState, info: ServerInformation) {
        let (state_changed, info_changed) = {
            let mut inner = self.lock();
            let state_changed = inner.state != state;
            let info_changed = inner.info != info;
            inner.state = state;
            inner.info = info;
            (state_changed, info_changed)
        };

        if state == ServerState::Disconnected {
            self.pool.clear();
        }

        if state_changed || info_changed {
            self.on_changed(state_changed);
        }
    }

    /// Connects unless the instance is connecting, connected or permanently
    /// disconnected. On failure the error is recorded, the pool is cleared
    /// and the instance is left Disconnected.
    pub fn connect(&self) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.permanently_disconnected || inner.state == ServerState::Connecting ||
               inner.state == ServerState::Connected {
                return Ok(());
            }
            inner.state = ServerState::Connecting;
        }

        self.on_state_changed();

        let result = self.pool
            .acquire(None, &AcquireOptions::default())
            .and_then(|connection| {
                let mut connection = PooledConnection::new(connection, self.pool.clone());
                self.ping_with(&mut connection)?;
                self.lookup_server_information(&mut connection)
            });

        let result = match result {
            Ok(()) => self.mark_connected(),
            Err(err) => Err(self.record_failure(err)),
        };

        if !self.is_permanently_disconnected() {
            self.pool.start_maintenance();
        }
        result
    }

    // An instance dropped from its topology while the handshake was in
    // flight stays down.
    fn mark_connected(&self) -> Result<()> {
        if self.is_permanently_disconnected() {
            self.pool.clear();
            self.set_state(ServerState::Disconnected);
            return Err(OperationError(format!("Server instance {} was removed while connecting.",
                                              self.address())));
        }

        self.lock().connect_error = None;
        self.set_state(ServerState::Connected);
        Ok(())
    }

    // Stores the error, clears the pool and marks the instance Disconnected.
    fn record_failure(&self, err: Error) -> Error {
        let err = Arc::new(err);
        let address = {
            let mut inner = self.lock();
            inner.connect_error = Some(err.clone());
            inner.address.clone()
        };

        debug!("server instance {} ({}) failed: {}", self.sequential_id, address, err);
        self.pool.clear();
        self.set_state(ServerState::Disconnected);
        Error::connection_failed("Unable to connect to server", vec![(address, err)])
    }

    /// Pings the instance and refreshes its handshake information, leaving
    /// it Connected on success and Disconnected on failure.
    pub fn verify_state(&self) -> Result<()> {
        let result = self.pool
            .acquire(None, &AcquireOptions::verification())
            .and_then(|connection| {
                let mut connection = PooledConnection::new(connection, self.pool.clone());
                self.ping_with(&mut connection)?;
                self.lookup_server_information(&mut connection)
            });

        match result {
            Ok(()) => self.mark_connected(),
            Err(err) => Err(self.record_failure(err)),
        }
    }

    /// Measures one round trip and folds it into the average ping time.
    pub fn ping(&self) -> Result<()> {
        let connection = self.pool.acquire(None, &AcquireOptions::verification())?;
        let mut connection = PooledConnection::new(connection, self.pool.clone());
        self.ping_with(&mut connection)
    }

    fn ping_with(&self, connection: &mut Connection) -> Result<()> {
        let started = Instant::now();
        match self.context.commands.ping(connection) {
            Ok(()) => {
                let previous = self.ping_times.average();
                let average = self.ping_times.include(started.elapsed());
                if average != previous {
                    self.context.listener.emit(&ServerEvent::PingTimeChanged {
                        address: self.address(),
                        average: average,
                    });
                }
                Ok(())
            }
            Err(err) => {
                self.ping_times.clear();
                self.set_state(ServerState::Disconnected);
                Err(err)
            }
        }
    }

    fn lookup_server_information(&self, connection: &mut Connection) -> Result<()> {
        match self.context.commands.is_master(connection) {
            Ok(result) => {
                let state = self.state();
                self.set_state_and_info(state, ServerInformation::from_is_master(result));
                Ok(())
            }
            Err(err) => {
                let failed = self.lock().info.failed(None);
                self.set_state_and_info(ServerState::Disconnected, failed);
                Err(err)
            }
        }
    }

    /// Stops maintenance, clears the pool and moves to Disconnected.
    pub fn disconnect(&self) {
        self.pool.stop_maintenance();

        {
            let mut inner = self.lock();
            if inner.state == ServerState::Disconnecting || inner.state == ServerState::Disconnected {
                return;
            }
            inner.state = ServerState::Disconnecting;
        }

        self.on_state_changed();
        self.pool.clear();
        self.set_state(ServerState::Disconnected);
    }

    /// Disconnects and refuses every later connect.
    pub fn disconnect_permanently(&self) {
        self.lock().permanently_disconnected = true;
        self.disconnect();
    }

    /// Checks out a connection authenticated for `context`. An instance in
    /// state Unknown is verified first.
    pub fn acquire_connection(&self, context: Option<&AuthContext>) -> Result<Connection> {
        if self.state() == ServerState::Unknown {
            self.verify_state()?;
        }

        let (state, address) = {
            let inner = self.lock();
            (inner.state, inner.address.clone())
        };

        if state != ServerState::Connected {
            return Err(OperationError(format!("Server instance {} is no longer connected.", address)));
        }

        let mut connection = self.pool.acquire(context, &AcquireOptions::default())?;

        if let Some(context) = context {
            if let Err(err) = connection.check_authentication(context) {
                if let Err(release_err) = self.pool.release(connection) {
                    warn!("unable to release a connection to {}: {}", address, release_err);
                }
                return Err(err);
            }
        }

        Ok(connection)
    }

    /// Like `acquire_connection`, but the connection returns to the pool
    /// when dropped.
    pub fn acquire_pooled(&self, context: Option<&AuthContext>) -> Result<PooledConnection> {
        let connection = self.acquire_connection(context)?;
        Ok(PooledConnection::new(connection, self.pool.clone()))
    }

    pub fn release_connection(&self, connection: Connection) -> Result<()> {
        self.pool.release(connection)
    }
}
