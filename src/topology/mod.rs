//! Topology discovery and server selection.
//!
//! A proxy owns the server instances of one logical server and chooses
//! among them. `Proxy` is the sum of the four variants:
//!
//! * `DirectProxy` talks to exactly one instance.
//! * `ReplicaSetProxy` and `ShardedProxy` keep a live member list that is
//!   updated by a background thread draining instance state changes.
//! * `DiscoveringProxy` races the seed list once, classifies the first
//!   instance that answers and delegates to the matching proxy from then on.
pub mod connected;
pub mod connector;
pub mod direct;
pub mod discovering;
pub mod handshake;
pub mod instance;
pub mod multiple;
pub mod ping;
pub mod replica_set;
pub mod sharded;

pub use self::direct::DirectProxy;
pub use self::discovering::DiscoveringProxy;
pub use self::instance::{InstanceType, ReplicaSetInformation, ServerInstance, ServerState};
pub use self::replica_set::ReplicaSetProxy;
pub use self::sharded::ShardedProxy;

use Result;

use apm::Listener;
use auth::Authenticator;
use common::ServerSelector;
use settings::{ConnectionMode, ServerSettings};
use stream::StreamConnector;

use self::handshake::{CommandRunner, WireCommandRunner};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// The state of a proxy as a whole.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProxyState {
    Disconnected,
    Connecting,
    /// Some, but not all, known instances are connected.
    ConnectedToSubset,
    Connected,
    Disconnecting,
    Unknown,
}

/// Everything an instance, its pool and its connections share: settings and
/// the collaborators used to open sockets, run monitoring commands,
/// authenticate and report events.
pub struct ServerContext {
    pub settings: ServerSettings,
    pub connector: StreamConnector,
    pub commands: Arc<dyn CommandRunner>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub listener: Listener,
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("settings", &self.settings)
            .field("connector", &self.connector)
            .field("authenticator", &self.authenticator.is_some())
            .field("listener", &self.listener)
            .finish()
    }
}

impl ServerContext {
    /// A context that connects over TCP and speaks the wire protocol.
    pub fn new(settings: ServerSettings) -> ServerContext {
        ServerContext {
            settings: settings,
            connector: StreamConnector::default(),
            commands: Arc::new(WireCommandRunner),
            authenticator: None,
            listener: Listener::new(),
        }
    }

    pub fn with_connector(mut self, connector: StreamConnector) -> ServerContext {
        self.connector = connector;
        self
    }

    pub fn with_command_runner<C>(mut self, commands: C) -> ServerContext
        where C: CommandRunner + 'static
    {
        self.commands = Arc::new(commands);
        self
    }

    pub fn with_authenticator<A>(mut self, authenticator: A) -> ServerContext
        where A: Authenticator + 'static
    {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }
}

/// The operations every proxy variant supports.
pub trait ServerProxy {
    fn state(&self) -> ProxyState;

    /// Every instance the proxy currently knows about.
    fn instances(&self) -> Vec<Arc<ServerInstance>>;

    /// Incremented each time the proxy starts a new round of connects.
    fn connection_attempt(&self) -> usize;

    fn replica_set_name(&self) -> Option<String> {
        None
    }

    fn primary(&self) -> Option<Arc<ServerInstance>> {
        None
    }

    /// Chooses an instance for the selector, connecting first if nothing
    /// suitable is connected yet.
    fn choose_server_instance(&self, selector: &dyn ServerSelector) -> Result<Arc<ServerInstance>>;

    /// Connects until an instance suitable for the selector is available or
    /// the timeout elapses.
    fn connect(&self, timeout: Duration, selector: &dyn ServerSelector) -> Result<()>;

    fn disconnect(&self);

    fn ping(&self) -> Result<()>;

    fn verify_state(&self) -> Result<()>;
}

/// A proxy of any variant.
#[derive(Debug)]
pub enum Proxy {
    Direct(DirectProxy),
    ReplicaSet(ReplicaSetProxy),
    Sharded(ShardedProxy),
    Discovering(DiscoveringProxy),
}

macro_rules! dispatch {
    ($proxy:expr, $inner:ident => $body:expr) => {
        match *$proxy {
            Proxy::Direct(ref $inner) => $body,
            Proxy::ReplicaSet(ref $inner) => $body,
            Proxy::Sharded(ref $inner) => $body,
            Proxy::Discovering(ref $inner) => $body,
        }
    }
}

impl Proxy {
    /// Builds the proxy the settings call for.
    ///
    /// Direct mode, or automatic mode with a single seed, talks to that
    /// seed. A replica set mode or a configured set name builds a replica
    /// set proxy. Shard router mode builds a sharded proxy. Anything else
    /// discovers the topology on first use.
    pub fn new(context: Arc<ServerContext>) -> Result<Proxy> {
        context.settings.validate()?;

        let settings = &context.settings;
        let proxy = match settings.connection_mode {
            ConnectionMode::Direct => Proxy::Direct(DirectProxy::new(context.clone())),
            ConnectionMode::ReplicaSet => Proxy::ReplicaSet(ReplicaSetProxy::new(context.clone())),
            ConnectionMode::ShardRouter => Proxy::Sharded(ShardedProxy::new(context.clone())),
            ConnectionMode::Automatic => {
                if settings.replica_set_name.is_some() {
                    Proxy::ReplicaSet(ReplicaSetProxy::new(context.clone()))
                } else if settings.hosts.len() == 1 {
                    Proxy::Direct(DirectProxy::new(context.clone()))
                } else {
                    Proxy::Discovering(DiscoveringProxy::new(context.clone()))
                }
            }
        };

        debug!("created a {} proxy for {} seed(s)", proxy.kind(), settings.hosts.len());
        Ok(proxy)
    }

    /// A short name for the variant, used in logs.
    pub fn kind(&self) -> &'static str {
        match *self {
            Proxy::Direct(_) => "direct",
            Proxy::ReplicaSet(_) => "replica set",
            Proxy::Sharded(_) => "sharded",
            Proxy::Discovering(_) => "discovering",
        }
    }
}

impl ServerProxy for Proxy {
    fn state(&self) -> ProxyState {
        dispatch!(self, proxy => proxy.state())
    }

    fn instances(&self) -> Vec<Arc<ServerInstance>> {
        dispatch!(self, proxy => proxy.instances())
    }

    fn connection_attempt(&self) -> usize {
        dispatch!(self, proxy => proxy.connection_attempt())
    }

    fn replica_set_name(&self) -> Option<String> {
        dispatch!(self, proxy => proxy.replica_set_name())
    }

    fn primary(&self) -> Option<Arc<ServerInstance>> {
        dispatch!(self, proxy => proxy.primary())
    }

    fn choose_server_instance(&self, selector: &dyn ServerSelector) -> Result<Arc<ServerInstance>> {
        dispatch!(self, proxy => proxy.choose_server_instance(selector))
    }

    fn connect(&self, timeout: Duration, selector: &dyn ServerSelector) -> Result<()> {
        dispatch!(self, proxy => proxy.connect(timeout, selector))
    }

    fn disconnect(&self) {
        dispatch!(self, proxy => proxy.disconnect())
    }

    fn ping(&self) -> Result<()> {
        dispatch!(self, proxy => proxy.ping())
    }

    fn verify_state(&self) -> Result<()> {
        dispatch!(self, proxy => proxy.verify_state())
    }
}

impl From<ServerState> for ProxyState {
    fn from(state: ServerState) -> ProxyState {
        match state {
            ServerState::Disconnected => ProxyState::Disconnected,
            ServerState::Connecting => ProxyState::Connecting,
            ServerState::Connected => ProxyState::Connected,
            ServerState::Disconnecting => ProxyState::Disconnecting,
            ServerState::Unknown => ProxyState::Unknown,
        }
    }
}
