//! Replica set topology: one primary, any number of secondaries.
use Result;
use Error::InternalInvariant;

use topology::ProxyState;
use topology::connector::{MemberSet, ReplicaSetConnector};
use topology::instance::{InstanceType, ServerInstance, ServerState};
use topology::multiple::{Changes, MultipleInstanceProxy, Shared, Topology, TopologyStrategy};

use std::sync::Arc;
use std::time::Duration;

/// A proxy that follows a replica set's membership.
pub type ReplicaSetProxy = MultipleInstanceProxy<ReplicaSet>;

/// Folds member states into the replica set's state. The order of the tests
/// resolves states that would otherwise match more than one rule.
pub fn determine_replica_set_state(current: ProxyState, states: &[ServerState]) -> Result<ProxyState> {
    let all = |state: ServerState| states.iter().all(|s| *s == state);
    let any = |state: ServerState| states.iter().any(|s| *s == state);

    if current == ProxyState::Disconnecting {
        if all(ServerState::Disconnected) {
            return Ok(ProxyState::Disconnected);
        }
        return Ok(ProxyState::Disconnecting);
    }

    if states.is_empty() || all(ServerState::Disconnected) {
        Ok(ProxyState::Disconnected)
    } else if all(ServerState::Connected) {
        Ok(ProxyState::Connected)
    } else if any(ServerState::Connecting) {
        Ok(ProxyState::Connecting)
    } else if any(ServerState::Unknown) {
        Ok(ProxyState::Unknown)
    } else if any(ServerState::Connected) {
        Ok(ProxyState::ConnectedToSubset)
    } else {
        Err(InternalInvariant(format!("Unexpected replica set member states: {:?}.", states)))
    }
}

/// The replica set strategy.
#[derive(Clone, Copy, Debug)]
pub struct ReplicaSet;

impl TopologyStrategy for ReplicaSet {
    const NAME: &'static str = "replica set";

    fn determine_state(current: ProxyState, states: &[ServerState]) -> Result<ProxyState> {
        determine_replica_set_state(current, states)
    }

    fn validate(topology: &Topology, instance: &ServerInstance) -> ::std::result::Result<(), String> {
        if instance.instance_type() != InstanceType::ReplicaSetMember {
            return Err(format!("{} is a {:?}, not a replica set member.",
                               instance.address(),
                               instance.instance_type()));
        }

        let name = instance.replica_set_information().map(|info| info.name).unwrap_or_default();
        match topology.replica_set_name {
            Some(ref pinned) if *pinned != name => {
                Err(format!("{} belongs to replica set '{}', expected '{}'.", instance.address(), name, pinned))
            }
            _ => Ok(()),
        }
    }

    fn on_connected(topology: &mut Topology, instance: &Arc<ServerInstance>, changes: &mut Changes) {
        let info = match instance.replica_set_information() {
            Some(info) => info,
            None => return,
        };

        if instance.is_primary() {
            topology.primary = Some(instance.clone());
            if topology.replica_set_name.is_none() {
                topology.replica_set_name = Some(info.name.clone());
            }

            if info.members.is_empty() {
                return;
            }

            // The primary's view of the set wins.
            for member in &topology.instances {
                if !info.members.contains(&member.address()) {
                    changes.remove.push(member.clone());
                }
            }
            for address in info.members {
                if topology.find(&address).is_none() {
                    changes.add.push(address);
                }
            }
        } else {
            if topology.primary.as_ref().map_or(false, |p| Arc::ptr_eq(p, instance)) {
                topology.primary = None;
            }

            if let Some(primary) = info.primary {
                if topology.find(&primary).is_none() {
                    changes.add.push(primary);
                }
            }
        }
    }

    fn connect_seeds(shared: &Arc<Shared<Self>>, timeout: Duration) -> Result<()> {
        let members: Arc<dyn MemberSet> = shared.clone();
        match ReplicaSetConnector::new(members, timeout).connect() {
            Ok(primary) => {
                debug!("found the replica set primary at {}", primary.address());
                Ok(())
            }
            // With no members left there is nothing the selector could find.
            Err(err) if shared.members().is_empty() => Err(err),
            Err(err) => {
                debug!("no primary found while connecting the seeds: {}", err);
                Ok(())
            }
        }
    }
}
