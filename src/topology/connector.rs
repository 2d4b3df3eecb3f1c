//! One-shot connect orchestration used during initial discovery.
use {Error, Result};
use Error::{ConnectionTimeout, TopologyMismatch};

use connstring::ServerAddress;
use queue::{submit_work, HandoffQueue};
use topology::instance::{ServerInstance, ServerState};

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SETTLE_POLL_MS: u64 = 10;

/// Collects the connect errors recorded on `instances` into an aggregate.
/// A deadline that passed with no recorded error is reported as a timeout.
pub fn connect_failure(prefix: &str, instances: &[Arc<ServerInstance>], timed_out: bool) -> Error {
    let causes: Vec<(ServerAddress, Arc<Error>)> = instances.iter()
        .filter_map(|instance| instance.connect_error().map(|err| (instance.address(), err)))
        .collect();

    if timed_out && causes.is_empty() {
        ConnectionTimeout(format!("{}: timed out.", prefix))
    } else {
        Error::connection_failed(prefix, causes)
    }
}

/// Connects one instance on a background worker, waiting at most `timeout`.
/// The attempt carries on in the background after a timeout.
#[derive(Clone, Copy, Debug)]
pub struct DirectConnector {
    timeout: Duration,
}

impl DirectConnector {
    pub fn new(timeout: Duration) -> DirectConnector {
        DirectConnector { timeout: timeout }
    }

    pub fn connect(&self, instance: &Arc<ServerInstance>) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let queue = Arc::new(HandoffQueue::new());
        let target = instance.clone();
        submit_work(&queue, move || target.connect());

        match queue.dequeue_timeout(self.timeout) {
            Some(Ok(())) => self.settle(instance, deadline),
            Some(Err(err)) => Err(err),
            None => Err(self.timed_out(instance)),
        }
    }

    // Another caller may own the attempt in progress; wait for its outcome.
    fn settle(&self, instance: &Arc<ServerInstance>, deadline: Instant) -> Result<()> {
        while instance.state() == ServerState::Connecting {
            if Instant::now() >= deadline {
                return Err(self.timed_out(instance));
            }
            thread::sleep(Duration::from_millis(SETTLE_POLL_MS));
        }

        if instance.state() == ServerState::Connected {
            Ok(())
        } else {
            Err(connect_failure("Unable to connect to server", &[instance.clone()], false))
        }
    }

    fn timed_out(&self, instance: &Arc<ServerInstance>) -> Error {
        ConnectionTimeout(format!("Timed out after {:?} connecting to {}.", self.timeout, instance.address()))
    }
}

/// The member list a `ReplicaSetConnector` reconciles while it connects.
pub trait MemberSet: Send + Sync {
    /// True while the instance is still one of the members.
    fn contains(&self, instance: &Arc<ServerInstance>) -> bool;

    /// Adds a member for `address` unless one exists. Returns the new
    /// instance, which the caller is expected to connect.
    fn add_member(&self, address: &ServerAddress) -> Option<Arc<ServerInstance>>;

    /// Removes and permanently disconnects the instance.
    fn remove_member(&self, instance: &Arc<ServerInstance>);

    /// Moves the instance to the address its server reports. Any other
    /// member already at that address is removed.
    fn adopt_address(&self, instance: &Arc<ServerInstance>, address: ServerAddress);

    /// Pins the replica set name. Returns false if another name is pinned.
    fn pin_replica_set_name(&self, name: &str) -> bool;

    fn members(&self) -> Vec<Arc<ServerInstance>>;
}

// What the connector has learned so far.
struct Discovery {
    replica_set_name: Option<String>,
    pending: usize,
}

/// Connects every member in parallel and returns as soon as a live primary
/// answers. Responses that arrive after that are validated on a background
/// thread.
pub struct ReplicaSetConnector {
    members: Arc<dyn MemberSet>,
    timeout: Duration,
}

impl ReplicaSetConnector {
    pub fn new(members: Arc<dyn MemberSet>, timeout: Duration) -> ReplicaSetConnector {
        ReplicaSetConnector {
            members: members,
            timeout: timeout,
        }
    }

    pub fn connect(&self) -> Result<Arc<ServerInstance>> {
        let deadline = Instant::now() + self.timeout;
        let queue: Arc<HandoffQueue<Arc<ServerInstance>>> = Arc::new(HandoffQueue::new());
        let mut attempted = self.members.members();

        let mut discovery = Discovery {
            replica_set_name: None,
            pending: 0,
        };

        for instance in &attempted {
            connect_async(&queue, instance);
            discovery.pending += 1;
        }

        while discovery.pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let instance = match queue.dequeue_timeout(deadline - now) {
                Some(instance) => instance,
                None => break,
            };
            discovery.pending -= 1;

            for added in self.process_response(&queue, &mut discovery, &instance) {
                attempted.push(added);
            }

            if instance.state() == ServerState::Connected && instance.is_primary() &&
               self.members.contains(&instance) {
                self.validate_remaining(queue, discovery);
                return Ok(instance);
            }
        }

        // Responses still pending mean the deadline cut the round short.
        Err(connect_failure("Unable to connect to the primary of the replica set",
                            &attempted,
                            discovery.pending > 0))
    }

    // Validates one response. Returns the instances it caused to be added.
    fn process_response(&self,
                        queue: &Arc<HandoffQueue<Arc<ServerInstance>>>,
                        discovery: &mut Discovery,
                        instance: &Arc<ServerInstance>)
                        -> Vec<Arc<ServerInstance>> {
        if instance.state() != ServerState::Connected {
            return Vec::new();
        }

        let info = match instance.replica_set_information() {
            Some(info) => info,
            None => {
                self.reject(instance, format!("{} is not a replica set member.", instance.address()));
                return Vec::new();
            }
        };

        match discovery.replica_set_name {
            Some(ref name) if *name != info.name => {
                self.reject(instance,
                            format!("{} belongs to replica set '{}', expected '{}'.",
                                    instance.address(),
                                    info.name,
                                    name));
                return Vec::new();
            }
            Some(_) => return Vec::new(),
            None => {}
        }

        if !self.members.pin_replica_set_name(&info.name) {
            self.reject(instance,
                        format!("{} belongs to replica set '{}', which is not the configured set.",
                                instance.address(),
                                info.name));
            return Vec::new();
        }

        if let Some(me) = instance.is_master_result().and_then(|result| result.me) {
            self.members.adopt_address(instance, me);
        }

        debug!("replica set '{}' identified by {}", info.name, instance.address());
        discovery.replica_set_name = Some(info.name.clone());

        if info.members.is_empty() {
            return Vec::new();
        }

        for member in self.members.members() {
            if !info.members.contains(&member.address()) {
                debug!("{} is not a member of replica set '{}'", member.address(), info.name);
                self.members.remove_member(&member);
            }
        }

        let mut added = Vec::new();
        for address in &info.members {
            if let Some(member) = self.members.add_member(address) {
                connect_async(queue, &member);
                discovery.pending += 1;
                added.push(member);
            }
        }
        added
    }

    fn reject(&self, instance: &Arc<ServerInstance>, message: String) {
        warn!("{}", message);
        instance.set_connect_error(TopologyMismatch(message));
        self.members.remove_member(instance);
    }

    fn validate_remaining(&self, queue: Arc<HandoffQueue<Arc<ServerInstance>>>, mut discovery: Discovery) {
        if discovery.pending == 0 {
            return;
        }

        let connector = ReplicaSetConnector {
            members: self.members.clone(),
            timeout: self.timeout,
        };

        let spawned = thread::Builder::new()
            .name("mongodb-topology-rs-connector".to_owned())
            .spawn(move || {
                let deadline = Instant::now() + connector.timeout;
                while discovery.pending > 0 {
                    let now = Instant::now();
                    if now >= deadline {
                        return;
                    }
                    match queue.dequeue_timeout(deadline - now) {
                        Some(instance) => {
                            discovery.pending -= 1;
                            connector.process_response(&queue, &mut discovery, &instance);
                        }
                        None => return,
                    }
                }
            });

        if let Err(err) = spawned {
            error!("unable to validate the remaining replica set members: {}", err);
        }
    }
}

fn connect_async(queue: &Arc<HandoffQueue<Arc<ServerInstance>>>, instance: &Arc<ServerInstance>) {
    let instance = instance.clone();
    submit_work(queue, move || {
        if let Err(err) = instance.connect() {
            debug!("connecting to {} failed: {}", instance.address(), err);
        }
        instance
    });
}
