//! The engine shared by the replica set and sharded proxies.
//!
//! Each instance pushes itself onto the proxy's handoff queue whenever its
//! state changes. One background thread per proxy drains that queue and is
//! the only place the member list is reconciled; the proxy state is
//! recomputed after every processed instance.
use {Error, Result};
use Error::TopologyMismatch;

use apm::ServerEvent;
use common::ServerSelector;
use connstring::ServerAddress;
use queue::{submit_work, HandoffQueue};
use topology::{ProxyState, ServerContext, ServerProxy};
use topology::connected::ConnectedInstanceCollection;
use topology::connector::{connect_failure, MemberSet};
use topology::instance::{ServerInstance, ServerState};

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

// How long the connect loop waits between looks at the connected set.
const CONNECT_POLL_MS: u64 = 20;
// How long the processor waits for a state change before checking whether
// its proxy still exists.
const PROCESSOR_POLL_MS: u64 = 500;

/// The mutable part of a multiple-instance proxy, guarded by one lock.
#[derive(Debug)]
pub struct Topology {
    pub instances: Vec<Arc<ServerInstance>>,
    pub state: ProxyState,
    pub connection_attempt: usize,
    pub replica_set_name: Option<String>,
    pub primary: Option<Arc<ServerInstance>>,
}

impl Topology {
    pub fn contains(&self, instance: &Arc<ServerInstance>) -> bool {
        self.instances.iter().any(|i| Arc::ptr_eq(i, instance))
    }

    pub fn find(&self, address: &ServerAddress) -> Option<&Arc<ServerInstance>> {
        self.instances.iter().find(|i| i.address() == *address)
    }
}

/// Membership changes a strategy asks for while processing an instance.
#[derive(Debug, Default)]
pub struct Changes {
    pub add: Vec<ServerAddress>,
    pub remove: Vec<Arc<ServerInstance>>,
}

/// What distinguishes one multiple-instance topology from another.
pub trait TopologyStrategy: Send + Sync + Sized + 'static {
    /// Names the topology in logs and errors.
    const NAME: &'static str;

    /// Folds the instance states into the proxy state.
    fn determine_state(current: ProxyState, states: &[ServerState]) -> Result<ProxyState>;

    /// Checks that a connected instance belongs to this topology.
    fn validate(topology: &Topology, instance: &ServerInstance) -> ::std::result::Result<(), String>;

    /// Reconciles the member list against what a valid, connected instance
    /// reported.
    fn on_connected(topology: &mut Topology, instance: &Arc<ServerInstance>, changes: &mut Changes);

    /// Runs before the first round of connects.
    fn connect_seeds(shared: &Arc<Shared<Self>>, timeout: Duration) -> Result<()> {
        let _ = (shared, timeout);
        Ok(())
    }
}

/// State shared between a proxy and its processor thread.
pub struct Shared<S: TopologyStrategy> {
    context: Arc<ServerContext>,
    topology: Mutex<Topology>,
    changed: Condvar,
    connected: ConnectedInstanceCollection,
    queue: Arc<HandoffQueue<Arc<ServerInstance>>>,
    strategy: PhantomData<S>,
}

/// A proxy over a live list of instances, parameterized by topology.
pub struct MultipleInstanceProxy<S: TopologyStrategy> {
    shared: Arc<Shared<S>>,
}

impl<S: TopologyStrategy> fmt::Debug for MultipleInstanceProxy<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let topology = self.shared.lock();
        f.debug_struct("MultipleInstanceProxy")
            .field("topology", &S::NAME)
            .field("state", &topology.state)
            .field("instances", &topology.instances.len())
            .field("replica_set_name", &topology.replica_set_name)
            .finish()
    }
}

impl<S: TopologyStrategy> MultipleInstanceProxy<S> {
    /// A proxy seeded with one instance per configured host.
    pub fn new(context: Arc<ServerContext>) -> MultipleInstanceProxy<S> {
        let instances = context.settings
            .hosts
            .iter()
            .map(|address| ServerInstance::new(address.clone(), context.clone()))
            .collect();
        MultipleInstanceProxy::with_instances(context, instances, Arc::new(HandoffQueue::new()), 0)
    }

    /// A proxy that takes over instances discovered elsewhere, together with
    /// the queue their in-flight connects report to.
    pub fn with_instances(context: Arc<ServerContext>,
                          instances: Vec<Arc<ServerInstance>>,
                          queue: Arc<HandoffQueue<Arc<ServerInstance>>>,
                          connection_attempt: usize)
                          -> MultipleInstanceProxy<S> {
        let shared = Arc::new(Shared {
            topology: Mutex::new(Topology {
                instances: Vec::new(),
                state: ProxyState::Disconnected,
                connection_attempt: connection_attempt,
                replica_set_name: context.settings.replica_set_name.clone(),
                primary: None,
            }),
            context: context,
            changed: Condvar::new(),
            connected: ConnectedInstanceCollection::new(),
            queue: queue,
            strategy: PhantomData,
        });

        {
            let mut topology = shared.lock();
            for instance in instances {
                instance.subscribe(shared.queue.clone());
                if instance.state() == ServerState::Connected {
                    shared.connected.add(&instance);
                    // Processed again so the member list is reconciled.
                    shared.queue.enqueue(instance.clone());
                }
                topology.instances.push(instance);
            }
        }

        start_processor(&shared);
        MultipleInstanceProxy { shared: shared }
    }

    pub fn connected_instances(&self) -> Vec<Arc<ServerInstance>> {
        self.shared.connected.instances()
    }
}

fn start_processor<S: TopologyStrategy>(shared: &Arc<Shared<S>>) {
    let weak: Weak<Shared<S>> = Arc::downgrade(shared);
    let queue = shared.queue.clone();

    let spawned = thread::Builder::new()
        .name(format!("mongodb-topology-{}", S::NAME.replace(' ', "-")))
        .spawn(move || {
            let poll = Duration::from_millis(PROCESSOR_POLL_MS);
            loop {
                let first = match queue.dequeue_timeout(poll) {
                    Some(instance) => instance,
                    None => {
                        if weak.upgrade().is_none() {
                            return;
                        }
                        continue;
                    }
                };

                let shared = match weak.upgrade() {
                    Some(shared) => shared,
                    None => return,
                };

                let mut batch = vec![first];
                while let Some(instance) = queue.try_dequeue() {
                    if !batch.iter().any(|i| Arc::ptr_eq(i, &instance)) {
                        batch.push(instance);
                    }
                }

                for instance in &batch {
                    shared.process(instance);
                }
            }
        });

    if let Err(err) = spawned {
        error!("unable to start the {} state processor: {}", S::NAME, err);
    }
}

impl<S: TopologyStrategy> Shared<S> {
    fn lock(&self) -> MutexGuard<Topology> {
        match self.topology.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn new_member(&self, topology: &mut Topology, address: ServerAddress) -> Arc<ServerInstance> {
        debug!("adding {} to the {}", address, S::NAME);
        let instance = ServerInstance::new(address, self.context.clone());
        instance.subscribe(self.queue.clone());
        topology.instances.push(instance.clone());
        instance
    }

    fn detach(&self, topology: &mut Topology, instance: &Arc<ServerInstance>) {
        debug!("removing {} from the {}", instance.address(), S::NAME);
        topology.instances.retain(|i| !Arc::ptr_eq(i, instance));
        self.connected.remove(instance);
        if topology.primary.as_ref().map_or(false, |p| Arc::ptr_eq(p, instance)) {
            topology.primary = None;
        }
        instance.unsubscribe();
    }

    fn connect_async(&self, instance: &Arc<ServerInstance>) {
        let instance = instance.clone();
        submit_work(&self.queue, move || {
            if let Err(err) = instance.connect() {
                debug!("connecting to {} failed: {}", instance.address(), err);
            }
            instance
        });
    }

    // Reprocesses one instance that changed state.
    fn process(&self, instance: &Arc<ServerInstance>) {
        let mut disconnect = Vec::new();
        let mut connect = Vec::new();

        let transition = {
            let mut topology = self.lock();

            if topology.contains(instance) && instance.state() == ServerState::Connected {
                self.canonicalize(&mut topology, instance, &mut disconnect);

                match S::validate(&topology, instance) {
                    Ok(()) => {
                        self.connected.add(instance);

                        let mut changes = Changes::default();
                        S::on_connected(&mut topology, instance, &mut changes);

                        for stale in changes.remove {
                            self.detach(&mut topology, &stale);
                            disconnect.push(stale);
                        }
                        for address in changes.add {
                            if topology.find(&address).is_none() {
                                connect.push(self.new_member(&mut topology, address));
                            }
                        }
                    }
                    Err(message) => {
                        warn!("{}", message);
                        instance.set_connect_error(TopologyMismatch(message));
                        self.detach(&mut topology, instance);
                        disconnect.push(instance.clone());
                    }
                }
            } else {
                self.connected.remove(instance);
                if topology.primary.as_ref().map_or(false, |p| Arc::ptr_eq(p, instance)) {
                    topology.primary = None;
                }
            }

            self.recompute_state(&mut topology)
        };

        self.changed.notify_all();

        for instance in disconnect {
            instance.disconnect_permanently();
        }
        for instance in &connect {
            self.connect_async(instance);
        }
        if let Some(state) = transition {
            self.on_state_changed(state);
        }
    }

    // Adopts the address the server reports for itself.
    fn canonicalize(&self,
                    topology: &mut Topology,
                    instance: &Arc<ServerInstance>,
                    disconnect: &mut Vec<Arc<ServerInstance>>) {
        if let Some(me) = instance.is_master_result().and_then(|result| result.me) {
            self.adopt(topology, instance, me, disconnect);
        }
    }

    // Moves the instance to `address`. Another instance already holding that
    // address is dropped, even when the move itself is a no-op.
    fn adopt(&self,
             topology: &mut Topology,
             instance: &Arc<ServerInstance>,
             address: ServerAddress,
             disconnect: &mut Vec<Arc<ServerInstance>>) {
        let duplicate = topology.instances
            .iter()
            .find(|i| !Arc::ptr_eq(i, instance) && i.address() == address)
            .cloned();

        if let Some(duplicate) = duplicate {
            debug!("{} and {} are the same server", duplicate.address(), instance.address());
            self.detach(topology, &duplicate);
            disconnect.push(duplicate);
        }

        if instance.address() != address {
            instance.set_address(address);
        }
    }

    // Returns the new state if it changed.
    fn recompute_state(&self, topology: &mut Topology) -> Option<ProxyState> {
        let states: Vec<ServerState> = topology.instances.iter().map(|i| i.state()).collect();
        let state = match S::determine_state(topology.state, &states) {
            Ok(state) => state,
            Err(err) => {
                error!("{}", err);
                return None;
            }
        };

        if state == topology.state {
            None
        } else {
            topology.state = state;
            Some(state)
        }
    }

    fn set_state(&self, topology: &mut Topology, state: ProxyState) -> Option<ProxyState> {
        if topology.state == state {
            None
        } else {
            topology.state = state;
            Some(state)
        }
    }

    fn on_state_changed(&self, state: ProxyState) {
        info!("{} proxy is now {:?}", S::NAME, state);
        self.context.listener.emit(&ServerEvent::ProxyStateChanged { state: state });
    }

    fn wait<'a>(&self, topology: MutexGuard<'a, Topology>, timeout: Duration) -> MutexGuard<'a, Topology> {
        match self.changed.wait_timeout(topology, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    fn connect(this: &Arc<Shared<S>>, timeout: Duration, selector: &dyn ServerSelector) -> Result<()> {
        let deadline = Instant::now() + timeout;

        let first_attempt = {
            let mut topology = this.lock();
            let first = topology.connection_attempt == 0 && topology.state == ProxyState::Disconnected;
            if first {
                topology.connection_attempt += 1;
            }
            first
        };

        if first_attempt {
            S::connect_seeds(this, timeout)?;
        }

        let mut transitions = Vec::new();
        let mut connect = Vec::new();
        let mut topology = this.lock();

        let result = loop {
            if this.connected.choose_server_instance(selector).is_some() {
                break Ok(());
            }

            if topology.instances.is_empty() {
                let message = match topology.replica_set_name {
                    Some(ref name) => {
                        format!("There were no {} members provided or discoverable with the name '{}'.",
                                S::NAME,
                                name)
                    }
                    None => format!("There were no {} members provided or discoverable.", S::NAME),
                };
                break Err(Error::connection_failed(&message, Vec::new()));
            }

            let now = Instant::now();
            if now >= deadline {
                let message = format!("Unable to connect to a member of the {} matching the read preference",
                                      S::NAME);
                break Err(connect_failure(&message, &topology.instances, true));
            }

            if topology.state == ProxyState::Connecting {
                let wait = ::std::cmp::min(deadline - now, Duration::from_millis(CONNECT_POLL_MS));
                topology = this.wait(topology, wait);
                continue;
            }

            if let Some(state) = this.set_state(&mut topology, ProxyState::Connecting) {
                transitions.push(state);
            }
            topology.connection_attempt += 1;

            for instance in &topology.instances {
                match instance.state() {
                    ServerState::Disconnected | ServerState::Unknown => connect.push(instance.clone()),
                    _ => {}
                }
            }

            if connect.is_empty() {
                // Nothing to wait for; fall back to what the instances say.
                if let Some(state) = this.recompute_state(&mut topology) {
                    transitions.push(state);
                }
                let wait = ::std::cmp::min(deadline - now, Duration::from_millis(CONNECT_POLL_MS));
                topology = this.wait(topology, wait);
            } else {
                drop(topology);
                for state in transitions.drain(..) {
                    this.on_state_changed(state);
                }
                for instance in connect.drain(..) {
                    this.connect_async(&instance);
                }
                let wait = ::std::cmp::min(deadline - now, Duration::from_millis(CONNECT_POLL_MS));
                topology = this.wait(this.lock(), wait);
            }
        };

        drop(topology);
        for state in transitions {
            this.on_state_changed(state);
        }
        result
    }
}

impl<S: TopologyStrategy> MemberSet for Shared<S> {
    fn contains(&self, instance: &Arc<ServerInstance>) -> bool {
        self.lock().contains(instance)
    }

    fn add_member(&self, address: &ServerAddress) -> Option<Arc<ServerInstance>> {
        let mut topology = self.lock();
        if topology.find(address).is_some() {
            return None;
        }
        Some(self.new_member(&mut topology, address.clone()))
    }

    fn remove_member(&self, instance: &Arc<ServerInstance>) {
        {
            let mut topology = self.lock();
            if !topology.contains(instance) {
                return;
            }
            self.detach(&mut topology, instance);
        }
        instance.disconnect_permanently();
    }

    fn adopt_address(&self, instance: &Arc<ServerInstance>, address: ServerAddress) {
        let mut disconnect = Vec::new();
        {
            let mut topology = self.lock();
            if !topology.contains(instance) {
                return;
            }
            self.adopt(&mut topology, instance, address, &mut disconnect);
        }
        for duplicate in disconnect {
            duplicate.disconnect_permanently();
        }
    }

    fn pin_replica_set_name(&self, name: &str) -> bool {
        let mut topology = self.lock();
        match topology.replica_set_name {
            Some(ref pinned) => return pinned == name,
            None => {}
        }
        topology.replica_set_name = Some(name.to_owned());
        true
    }

    fn members(&self) -> Vec<Arc<ServerInstance>> {
        self.lock().instances.clone()
    }
}

impl<S: TopologyStrategy> ServerProxy for MultipleInstanceProxy<S> {
    fn state(&self) -> ProxyState {
        self.shared.lock().state
    }

    fn instances(&self) -> Vec<Arc<ServerInstance>> {
        self.shared.lock().instances.clone()
    }

    fn connection_attempt(&self) -> usize {
        self.shared.lock().connection_attempt
    }

    fn replica_set_name(&self) -> Option<String> {
        self.shared.lock().replica_set_name.clone()
    }

    fn primary(&self) -> Option<Arc<ServerInstance>> {
        self.shared.lock().primary.clone()
    }

    fn choose_server_instance(&self, selector: &dyn ServerSelector) -> Result<Arc<ServerInstance>> {
        for attempt in 0..2 {
            if let Some(instance) = self.shared.connected.choose_server_instance(selector) {
                return Ok(instance);
            }

            if attempt == 0 {
                self.connect(self.shared.context.settings.connect_timeout, selector)?;
            }
        }

        Err(connect_failure(&format!("Unable to choose a server instance from the {}", S::NAME),
                            &self.instances(),
                            false))
    }

    fn connect(&self, timeout: Duration, selector: &dyn ServerSelector) -> Result<()> {
        Shared::connect(&self.shared, timeout, selector)
    }

    fn disconnect(&self) {
        let (instances, transition) = {
            let mut topology = self.shared.lock();
            if topology.state == ProxyState::Disconnected || topology.state == ProxyState::Disconnecting {
                return;
            }
            let transition = self.shared.set_state(&mut topology, ProxyState::Disconnecting);
            (topology.instances.clone(), transition)
        };

        if let Some(state) = transition {
            self.shared.on_state_changed(state);
        }

        for instance in &instances {
            instance.disconnect();
        }

        let transition = {
            let mut topology = self.shared.lock();
            self.shared.set_state(&mut topology, ProxyState::Disconnected)
        };

        self.shared.connected.clear();
        self.shared.changed.notify_all();
        if let Some(state) = transition {
            self.shared.on_state_changed(state);
        }
    }

    fn ping(&self) -> Result<()> {
        for instance in self.instances() {
            instance.ping()?;
        }
        Ok(())
    }

    /// Verifies every instance. Fails only if every instance failed, with
    /// the first failure.
    fn verify_state(&self) -> Result<()> {
        let instances = {
            let topology = self.shared.lock();
            if topology.state == ProxyState::Disconnected || topology.state == ProxyState::Disconnecting {
                return Ok(());
            }
            topology.instances.clone()
        };

        let mut first_error = None;
        let mut failures = 0;
        for instance in &instances {
            if let Err(err) = instance.verify_state() {
                failures += 1;
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) if failures == instances.len() => Err(err),
            _ => Ok(()),
        }
    }
}
