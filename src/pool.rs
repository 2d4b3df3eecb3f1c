//! Connection pooling for a single server instance.
use Result;
use Error::{ArgumentError, ConnectionTimeout, PoolExhausted};

use apm::ServerEvent;
use auth::AuthContext;
use connection::{Connection, ConnectionState};
use topology::{ServerContext, ServerState};
use topology::instance::ServerInstance;

use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// How long a state verification waits for a pooled connection.
pub const VERIFICATION_WAIT_QUEUE_TIMEOUT_MS: u64 = 2000;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Per-call overrides for acquiring a connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Bypasses the wait queue size limit.
    pub ok_to_exceed_wait_queue_size: bool,
    /// Overrides the configured wait queue timeout.
    pub wait_queue_timeout: Option<Duration>,
}

impl AcquireOptions {
    /// The options used when verifying an instance's state: the wait queue
    /// limit does not apply and the wait is short.
    pub fn verification() -> AcquireOptions {
        AcquireOptions {
            ok_to_exceed_wait_queue_size: true,
            wait_queue_timeout: Some(Duration::from_millis(VERIFICATION_WAIT_QUEUE_TIMEOUT_MS)),
        }
    }

    pub fn with_timeout(timeout: Duration) -> AcquireOptions {
        AcquireOptions {
            ok_to_exceed_wait_queue_size: false,
            wait_queue_timeout: Some(timeout),
        }
    }
}

/// A bounded pool of connections to one server instance.
///
/// `pool_size` counts available and checked-out connections and never
/// exceeds the configured maximum. `clear` bumps the generation; a
/// connection from an older generation is closed when released instead of
/// being returned to the pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    id: usize,
    instance: Weak<ServerInstance>,
    context: Arc<ServerContext>,
    state: Mutex<PoolState>,
    // Signalled whenever a connection is released or a slot frees up.
    released: Condvar,
    timer: Mutex<Option<Arc<TimerSignal>>>,
}

struct PoolState {
    // Ordered from least to most recently used.
    available: Vec<Connection>,
    pool_size: usize,
    wait_queue_size: usize,
    generation_id: usize,
    lifetime_evicted_since_tick: bool,
    top_up_running: bool,
}

// What the locked part of acquire decided. Sockets are opened and closed
// after the lock is released.
enum Checkout {
    Existing(Connection),
    Fresh(Connection),
    Replaced {
        evicted: Connection,
        fresh: Connection,
    },
}

struct TimerSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl TimerSignal {
    // Sleeps for `interval`. Returns true if the timer was stopped instead.
    fn sleep(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        let mut stopped = match self.stopped.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            stopped = match self.wake.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }

        true
    }

    fn stop(&self) {
        match self.stopped.lock() {
            Ok(mut guard) => *guard = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        self.wake.notify_all();
    }
}

impl PoolInner {
    // The pool's counters stay consistent across a panic in a caller, so a
    // poisoned lock is recovered rather than propagated.
    fn lock(&self) -> MutexGuard<PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Ok(mut timer) = self.timer.lock() {
            if let Some(signal) = timer.take() {
                signal.stop();
            }
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("pool_size", &state.pool_size)
            .field("available", &state.available.len())
            .field("generation_id", &state.generation_id)
            .finish()
    }
}

impl ConnectionPool {
    /// Creates an empty pool for the instance. The maintenance timer is not
    /// started until the instance connects.
    pub fn new(instance: Weak<ServerInstance>, context: Arc<ServerContext>) -> ConnectionPool {
        let capacity = context.settings.max_connection_pool_size;
        ConnectionPool {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::SeqCst),
                instance: instance,
                context: context,
                state: Mutex::new(PoolState {
                    available: Vec::with_capacity(capacity),
                    pool_size: 0,
                    wait_queue_size: 0,
                    generation_id: 0,
                    lifetime_evicted_since_tick: false,
                    top_up_running: false,
                }),
                released: Condvar::new(),
                timer: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Available plus checked-out connections.
    pub fn pool_size(&self) -> usize {
        self.inner.lock().pool_size
    }

    pub fn available_connections_count(&self) -> usize {
        self.inner.lock().available.len()
    }

    pub fn generation_id(&self) -> usize {
        self.inner.lock().generation_id
    }

    /// The number of callers currently inside `acquire`.
    pub fn wait_queue_size(&self) -> usize {
        self.inner.lock().wait_queue_size
    }

    fn description(&self) -> String {
        match self.inner.instance.upgrade() {
            Some(instance) => instance.address().to_string(),
            None => format!("pool {}", self.inner.id),
        }
    }

    fn new_connection(&self, generation_id: usize) -> Connection {
        Connection::new(self.inner.instance.clone(),
                        self.inner.context.clone(),
                        self.inner.id,
                        generation_id)
    }

    /// Checks out a connection that can serve `context`, opening a new one
    /// if none is available and the pool has room. Blocks until a connection
    /// is released or the wait queue timeout elapses.
    pub fn acquire(&self, context: Option<&AuthContext>, options: &AcquireOptions) -> Result<Connection> {
        let settings = &self.inner.context.settings;
        let timeout = options.wait_queue_timeout.unwrap_or(settings.wait_queue_timeout);
        let deadline = Instant::now().checked_add(timeout);

        let mut state = self.inner.lock();
        if !options.ok_to_exceed_wait_queue_size && state.wait_queue_size >= settings.wait_queue_size {
            return Err(PoolExhausted(format!("Too many threads are already waiting for a connection to {}.",
                                             self.description())));
        }

        state.wait_queue_size += 1;
        let (mut state, checkout) = self.checkout(state, context, deadline);
        state.wait_queue_size -= 1;
        drop(state);

        match checkout? {
            Checkout::Existing(connection) => Ok(connection),
            Checkout::Fresh(connection) => self.open_fresh(connection),
            Checkout::Replaced { mut evicted, fresh } => {
                debug!("replacing connection {} to {} that could not serve the request",
                       evicted.id(),
                       self.description());
                evicted.close();
                self.open_fresh(fresh)
            }
        }
    }

    // The locked part of acquire. The guard is handed back so the caller
    // can leave the wait queue on every path.
    fn checkout<'a>(&'a self,
                    mut state: MutexGuard<'a, PoolState>,
                    context: Option<&AuthContext>,
                    deadline: Option<Instant>)
                    -> (MutexGuard<'a, PoolState>, Result<Checkout>) {
        let max_size = self.inner.context.settings.max_connection_pool_size;

        loop {
            // Most recently used first.
            let found = state.available
                .iter()
                .rposition(|c| c.is_authenticated(context).unwrap_or(false))
                .or_else(|| {
                    state.available
                        .iter()
                        .rposition(|c| c.can_authenticate(context).unwrap_or(false))
                });

            if let Some(index) = found {
                let connection = state.available.remove(index);
                return (state, Ok(Checkout::Existing(connection)));
            }

            if !state.available.is_empty() && state.pool_size >= max_size {
                let evicted = state.available.remove(0);
                let fresh = self.new_connection(state.generation_id);
                return (state, Ok(Checkout::Replaced { evicted: evicted, fresh: fresh }));
            }

            if state.pool_size < max_size {
                // Reserve the slot before the socket is opened.
                state.pool_size += 1;
                let fresh = self.new_connection(state.generation_id);
                return (state, Ok(Checkout::Fresh(fresh)));
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let err = ConnectionTimeout(format!("Timed out waiting for a connection to {}.",
                                                            self.description()));
                        return (state, Err(err));
                    }
                    match self.inner.released.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => {
                    match self.inner.released.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    }
                }
            };
        }
    }

    fn open_fresh(&self, mut connection: Connection) -> Result<Connection> {
        match connection.open() {
            Ok(()) => Ok(connection),
            Err(err) => {
                self.discard(connection);
                Err(err)
            }
        }
    }

    // Closes a checked-out connection and frees its slot.
    fn discard(&self, mut connection: Connection) {
        connection.close();

        let mut state = self.inner.lock();
        // A clear already reset the size for older generations.
        if connection.generation_id() == state.generation_id && state.pool_size > 0 {
            state.pool_size -= 1;
        }
        drop(state);

        self.inner.released.notify_one();
    }

    /// Returns a connection to the pool. Stale, closed and (at most one per
    /// maintenance tick) over-aged connections are closed instead.
    pub fn release(&self, mut connection: Connection) -> Result<()> {
        if connection.pool_id() != self.inner.id {
            return Err(ArgumentError("The connection being released does not belong to this connection pool."
                .to_owned()));
        }

        let max_life_time = self.inner.context.settings.max_connection_life_time;

        let mut state = self.inner.lock();
        if connection.generation_id() != state.generation_id {
            drop(state);
            connection.close();
            return Ok(());
        }

        if connection.state() != ConnectionState::Open {
            drop(state);
            self.discard(connection);
            return Ok(());
        }

        if !state.lifetime_evicted_since_tick && connection.created_at().elapsed() > max_life_time {
            state.lifetime_evicted_since_tick = true;
            drop(state);
            debug!("closing connection {} to {} after its maximum life time",
                   connection.id(),
                   self.description());
            self.discard(connection);
            return Ok(());
        }

        connection.set_last_used_at(Instant::now());
        state.available.push(connection);
        drop(state);

        self.inner.released.notify_one();
        Ok(())
    }

    /// Closes every available connection and starts a new generation so
    /// checked-out connections are discarded when released.
    pub fn clear(&self) {
        let (closed, generation) = {
            let mut state = self.inner.lock();
            let closed = mem::replace(&mut state.available, Vec::new());
            state.pool_size = 0;
            state.generation_id += 1;
            (closed, state.generation_id)
        };

        self.inner.released.notify_all();

        for mut connection in closed {
            connection.close();
        }

        info!("cleared connection pool for {}, now at generation {}", self.description(), generation);

        if let Some(instance) = self.inner.instance.upgrade() {
            self.inner.context.listener.emit(&ServerEvent::PoolCleared {
                address: instance.address(),
                generation: generation,
            });
        }
    }

    /// Runs one maintenance tick. The instance is re-verified, which also
    /// brings back an instance whose server has recovered. Then at most one
    /// idle or over-aged connection is evicted, and a top-up to the minimum
    /// pool size is scheduled while the instance is connected.
    pub fn maintain(&self) {
        let instance = match self.inner.instance.upgrade() {
            Some(instance) => instance,
            None => return,
        };

        if instance.is_permanently_disconnected() {
            return;
        }

        match instance.state() {
            ServerState::Connecting | ServerState::Disconnecting => return,
            _ => {
                if let Err(err) = instance.verify_state() {
                    debug!("verifying {} during pool maintenance failed: {}", instance.address(), err);
                }
            }
        }

        self.evict_one();
        self.inner.lock().lifetime_evicted_since_tick = false;

        if instance.state() == ServerState::Connected {
            self.top_up();
        }
    }

    // Evicts the oldest connection past its life time, or failing that the
    // longest idle connection past the idle time.
    fn evict_one(&self) {
        let settings = &self.inner.context.settings;
        let now = Instant::now();

        let evicted = {
            let mut state = self.inner.lock();

            let too_old = state.available
                .iter()
                .enumerate()
                .filter(|&(_, c)| now.duration_since(c.created_at()) > settings.max_connection_life_time)
                .min_by_key(|&(_, c)| c.created_at())
                .map(|(index, _)| index);

            let index = too_old.or_else(|| {
                state.available
                    .iter()
                    .enumerate()
                    .filter(|&(_, c)| now.duration_since(c.last_used_at()) > settings.max_connection_idle_time)
                    .min_by_key(|&(_, c)| c.last_used_at())
                    .map(|(index, _)| index)
            });

            match index {
                Some(index) => {
                    state.pool_size -= 1;
                    Some(state.available.remove(index))
                }
                None => None,
            }
        };

        if let Some(mut connection) = evicted {
            debug!("evicting connection {} from the pool for {}", connection.id(), self.description());
            connection.close();
            self.inner.released.notify_one();
        }
    }

    fn top_up(&self) {
        let generation = {
            let mut state = self.inner.lock();
            if state.top_up_running || state.pool_size >= self.inner.context.settings.min_connection_pool_size {
                return;
            }
            state.top_up_running = true;
            state.generation_id
        };

        let pool = self.clone();
        let spawned = thread::Builder::new()
            .name("mongodb-topology-pool-fill".to_owned())
            .spawn(move || pool.fill_to_minimum(generation));

        if let Err(err) = spawned {
            error!("unable to start filling the pool for {}: {}", self.description(), err);
            self.inner.lock().top_up_running = false;
        }
    }

    // Opens connections one at a time until the minimum is reached. Stops if
    // a clear starts a new generation.
    fn fill_to_minimum(&self, generation: usize) {
        let min_size = self.inner.context.settings.min_connection_pool_size;

        loop {
            let connection = {
                let mut state = self.inner.lock();
                if state.generation_id != generation || state.pool_size >= min_size {
                    break;
                }
                state.pool_size += 1;
                self.new_connection(generation)
            };

            match self.open_fresh(connection) {
                Ok(connection) => {
                    if let Err(err) = self.release(connection) {
                        warn!("unable to add a connection to the pool for {}: {}", self.description(), err);
                        break;
                    }
                }
                Err(err) => {
                    warn!("unable to open a connection to {} while filling the pool: {}",
                          self.description(),
                          err);
                    break;
                }
            }
        }

        self.inner.lock().top_up_running = false;
    }

    /// Starts the background maintenance timer unless it is running.
    pub fn start_maintenance(&self) {
        let mut timer = match self.inner.timer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if timer.is_some() {
            return;
        }

        let signal = Arc::new(TimerSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });

        let thread_signal = signal.clone();
        let pool = Arc::downgrade(&self.inner);
        let interval = self.inner.context.settings.maintenance_interval;

        let spawned = thread::Builder::new()
            .name("mongodb-topology-pool-timer".to_owned())
            .spawn(move || {
                while !thread_signal.sleep(interval) {
                    match pool.upgrade() {
                        Some(inner) => ConnectionPool { inner: inner }.maintain(),
                        None => return,
                    }
                }
            });

        match spawned {
            Ok(_) => *timer = Some(signal),
            Err(err) => error!("unable to start the maintenance timer for {}: {}", self.description(), err),
        }
    }

    /// Stops the background maintenance timer. Does not wait for a tick in
    /// progress.
    pub fn stop_maintenance(&self) {
        let signal = match self.inner.timer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(signal) = signal {
            signal.stop();
        }
    }

    pub fn is_maintenance_running(&self) -> bool {
        match self.inner.timer.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}

/// A connection checked out of a pool. Returned to the pool when dropped.
pub struct PooledConnection {
    // Always Some(connection) until dropped or detached.
    connection: Option<Connection>,
    pool: ConnectionPool,
}

impl PooledConnection {
    pub fn new(connection: Connection, pool: ConnectionPool) -> PooledConnection {
        PooledConnection {
            connection: Some(connection),
            pool: pool,
        }
    }

    /// Detaches the connection. The caller becomes responsible for
    /// releasing it.
    pub fn into_inner(mut self) -> Connection {
        self.connection.take().expect("pooled connection already detached")
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection.as_ref().expect("pooled connection already detached")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection.as_mut().expect("pooled connection already detached")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err(err) = self.pool.release(connection) {
                warn!("unable to release a connection: {}", err);
            }
        }
    }
}
