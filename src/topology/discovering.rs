//! A proxy that works out what it is talking to on first use.
use Result;
use Error::TopologyMismatch;

use apm::ServerEvent;
use common::ServerSelector;
use queue::{submit_work, HandoffQueue};
use topology::{DirectProxy, Proxy, ProxyState, ReplicaSetProxy, ServerContext, ServerProxy, ShardedProxy};
use topology::connector::connect_failure;
use topology::instance::{InstanceType, ServerInstance, ServerState};

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Races connects across the seed list, classifies the first instance that
/// answers and from then on delegates everything to a proxy of the matching
/// kind. The delegate is resolved once and never replaced.
pub struct DiscoveringProxy {
    context: Arc<ServerContext>,
    seeds: Vec<Arc<ServerInstance>>,
    resolved: RwLock<Option<Arc<Proxy>>>,
    // Held for the duration of one discovery round.
    discovering: Mutex<()>,
    state: Mutex<ProxyState>,
    connection_attempt: AtomicUsize,
}

impl fmt::Debug for DiscoveringProxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DiscoveringProxy")
            .field("seeds", &self.seeds.len())
            .field("resolved", &self.resolved().map(|proxy| proxy.kind()))
            .finish()
    }
}

impl DiscoveringProxy {
    pub fn new(context: Arc<ServerContext>) -> DiscoveringProxy {
        let seeds = context.settings
            .hosts
            .iter()
            .map(|address| ServerInstance::new(address.clone(), context.clone()))
            .collect();

        DiscoveringProxy {
            context: context,
            seeds: seeds,
            resolved: RwLock::new(None),
            discovering: Mutex::new(()),
            state: Mutex::new(ProxyState::Disconnected),
            connection_attempt: AtomicUsize::new(0),
        }
    }

    /// The proxy discovery settled on, if it has run.
    pub fn resolved(&self) -> Option<Arc<Proxy>> {
        match self.resolved.read() {
            Ok(resolved) => resolved.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn lock_state(&self) -> MutexGuard<ProxyState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: ProxyState) {
        {
            let mut current = self.lock_state();
            if *current == state {
                return;
            }
            *current = state;
        }
        self.context.listener.emit(&ServerEvent::ProxyStateChanged { state: state });
    }

    /// Returns the delegate, running discovery first if needed.
    pub fn discover(&self, timeout: Duration) -> Result<Arc<Proxy>> {
        if let Some(proxy) = self.resolved() {
            return Ok(proxy);
        }

        let _round = self.discovering.lock()?;
        if let Some(proxy) = self.resolved() {
            return Ok(proxy);
        }

        let attempt = self.connection_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ProxyState::Connecting);

        match self.race(timeout, attempt) {
            Ok(proxy) => {
                info!("discovered a {} topology", proxy.kind());
                let proxy = Arc::new(proxy);
                match self.resolved.write() {
                    Ok(mut resolved) => *resolved = Some(proxy.clone()),
                    Err(poisoned) => *poisoned.into_inner() = Some(proxy.clone()),
                }
                Ok(proxy)
            }
            Err(err) => {
                warn!("topology discovery failed: {}", err);
                self.set_state(ProxyState::Disconnected);
                Err(err)
            }
        }
    }

    // Connects every seed in parallel and builds a proxy around the first
    // one that connects.
    fn race(&self, timeout: Duration, attempt: usize) -> Result<Proxy> {
        let deadline = Instant::now() + timeout;
        let queue: Arc<HandoffQueue<Arc<ServerInstance>>> = Arc::new(HandoffQueue::new());

        for seed in &self.seeds {
            if seed.state() == ServerState::Connected {
                queue.enqueue(seed.clone());
            } else {
                let seed = seed.clone();
                submit_work(&queue, move || {
                    if let Err(err) = seed.connect() {
                        debug!("connecting to seed {} failed: {}", seed.address(), err);
                    }
                    seed
                });
            }
        }

        let mut pending = self.seeds.len();
        while pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let instance = match queue.dequeue_timeout(deadline - now) {
                Some(instance) => instance,
                None => break,
            };
            pending -= 1;

            if instance.state() == ServerState::Connected {
                return self.classify(&instance, queue, attempt);
            }
        }

        Err(connect_failure("Unable to connect to any seed", &self.seeds, pending > 0))
    }

    fn classify(&self,
                instance: &Arc<ServerInstance>,
                queue: Arc<HandoffQueue<Arc<ServerInstance>>>,
                attempt: usize)
                -> Result<Proxy> {
        debug!("{} answered first as a {:?}", instance.address(), instance.instance_type());

        match instance.instance_type() {
            InstanceType::ReplicaSetMember => {
                Ok(Proxy::ReplicaSet(ReplicaSetProxy::with_instances(self.context.clone(),
                                                                     self.seeds.clone(),
                                                                     queue,
                                                                     attempt)))
            }
            InstanceType::ShardRouter => {
                Ok(Proxy::Sharded(ShardedProxy::with_instances(self.context.clone(),
                                                               self.seeds.clone(),
                                                               queue,
                                                               attempt)))
            }
            InstanceType::Standalone => {
                for seed in &self.seeds {
                    if !Arc::ptr_eq(seed, instance) {
                        seed.disconnect_permanently();
                    }
                }
                Ok(Proxy::Direct(DirectProxy::with_instance(instance.clone())))
            }
            InstanceType::Unknown => {
                Err(TopologyMismatch(format!("{} did not report a recognizable server type.", instance.address())))
            }
        }
    }
}

impl ServerProxy for DiscoveringProxy {
    fn state(&self) -> ProxyState {
        match self.resolved() {
            Some(proxy) => proxy.state(),
            None => *self.lock_state(),
        }
    }

    fn instances(&self) -> Vec<Arc<ServerInstance>> {
        match self.resolved() {
            Some(proxy) => proxy.instances(),
            None => self.seeds.clone(),
        }
    }

    fn connection_attempt(&self) -> usize {
        match self.resolved() {
            Some(proxy) => proxy.connection_attempt(),
            None => self.connection_attempt.load(Ordering::SeqCst),
        }
    }

    fn replica_set_name(&self) -> Option<String> {
        self.resolved().and_then(|proxy| proxy.replica_set_name())
    }

    fn primary(&self) -> Option<Arc<ServerInstance>> {
        self.resolved().and_then(|proxy| proxy.primary())
    }

    fn choose_server_instance(&self, selector: &dyn ServerSelector) -> Result<Arc<ServerInstance>> {
        let proxy = self.discover(self.context.settings.connect_timeout)?;
        proxy.choose_server_instance(selector)
    }

    fn connect(&self, timeout: Duration, selector: &dyn ServerSelector) -> Result<()> {
        let started = Instant::now();
        let proxy = self.discover(timeout)?;
        let remaining = timeout.checked_sub(started.elapsed()).unwrap_or_else(|| Duration::from_millis(0));
        proxy.connect(remaining, selector)
    }

    fn disconnect(&self) {
        match self.resolved() {
            Some(proxy) => proxy.disconnect(),
            None => {
                for seed in &self.seeds {
                    seed.disconnect();
                }
                self.set_state(ProxyState::Disconnected);
            }
        }
    }

    fn ping(&self) -> Result<()> {
        let proxy = self.discover(self.context.settings.connect_timeout)?;
        proxy.ping()
    }

    fn verify_state(&self) -> Result<()> {
        match self.resolved() {
            Some(proxy) => proxy.verify_state(),
            None => Ok(()),
        }
    }
}
