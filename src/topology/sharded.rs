//! Sharded topology: a set of interchangeable shard routers.
use Result;
use Error::InternalInvariant;

use topology::ProxyState;
use topology::instance::{InstanceType, ServerInstance, ServerState};
use topology::multiple::{Changes, MultipleInstanceProxy, Topology, TopologyStrategy};

use std::sync::Arc;

/// A proxy over a set of shard routers.
pub type ShardedProxy = MultipleInstanceProxy<Sharded>;

/// Folds router states into the cluster's state. A sharded cluster is usable
/// as soon as one router is, so any connected router wins over the rest.
pub fn determine_sharded_state(current: ProxyState, states: &[ServerState]) -> Result<ProxyState> {
    let all = |state: ServerState| states.iter().all(|s| *s == state);
    let any = |state: ServerState| states.iter().any(|s| *s == state);

    if current == ProxyState::Disconnecting {
        if all(ServerState::Disconnected) {
            return Ok(ProxyState::Disconnected);
        }
        return Ok(ProxyState::Disconnecting);
    }

    if states.is_empty() {
        Ok(ProxyState::Disconnected)
    } else if any(ServerState::Connected) {
        Ok(ProxyState::Connected)
    } else if all(ServerState::Disconnected) {
        Ok(ProxyState::Disconnected)
    } else if any(ServerState::Connecting) {
        Ok(ProxyState::Connecting)
    } else if any(ServerState::Unknown) {
        Ok(ProxyState::Unknown)
    } else {
        Err(InternalInvariant(format!("Unexpected shard router states: {:?}.", states)))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Sharded;

impl TopologyStrategy for Sharded {
    const NAME: &'static str = "sharded cluster";

    fn determine_state(current: ProxyState, states: &[ServerState]) -> Result<ProxyState> {
        determine_sharded_state(current, states)
    }

    fn validate(_: &Topology, instance: &ServerInstance) -> ::std::result::Result<(), String> {
        match instance.instance_type() {
            InstanceType::ShardRouter => Ok(()),
            other => Err(format!("{} is a {:?}, not a shard router.", instance.address(), other)),
        }
    }

    // Routers do not advertise each other.
    fn on_connected(_: &mut Topology, _: &Arc<ServerInstance>, _: &mut Changes) {}
}
