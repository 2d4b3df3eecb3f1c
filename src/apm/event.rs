use std::fmt::{Display, Error, Formatter};
use std::time::Duration;

use connstring::ServerAddress;
use topology::{ProxyState, ServerState};

/// Something observable happened to an instance, a pool or a proxy.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    InstanceStateChanged {
        address: ServerAddress,
        state: ServerState,
    },
    PingTimeChanged {
        address: ServerAddress,
        average: Duration,
    },
    ProxyStateChanged {
        state: ProxyState,
    },
    PoolCleared {
        address: ServerAddress,
        generation: usize,
    },
}

impl Display for ServerEvent {
    fn fmt(&self, fmt: &mut Formatter) -> Result<(), Error> {
        match *self {
            ServerEvent::InstanceStateChanged { ref address, state } => {
                fmt.write_fmt(format_args!("INSTANCE {} STATE: {:?}", address, state))
            }
            ServerEvent::PingTimeChanged { ref address, average } => {
                fmt.write_fmt(format_args!("INSTANCE {} PING: {:?}", address, average))
            }
            ServerEvent::ProxyStateChanged { state } => {
                fmt.write_fmt(format_args!("PROXY STATE: {:?}", state))
            }
            ServerEvent::PoolCleared { ref address, generation } => {
                fmt.write_fmt(format_args!("POOL {} CLEARED: generation {}", address, generation))
            }
        }
    }
}
