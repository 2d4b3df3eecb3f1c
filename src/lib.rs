//! Topology discovery, server selection and connection pooling for MongoDB
//! clients.
//!
//! A `Client` owns a proxy that watches one logical server: a single
//! `mongod`, a replica set or a set of shard routers. Operations ask the
//! client for a server instance matching a read preference, check a
//! connection out of that instance's pool, and let it go back to the pool
//! when done.
//!
//! ```no_run
//! # #[macro_use] extern crate bson;
//! # extern crate mongodb_topology;
//! # fn main() {
//! use mongodb_topology::Client;
//! use mongodb_topology::common::ReadPreference;
//!
//! let client = Client::with_uri("mongodb://localhost:27017,localhost:27018/?replicaSet=rs0")
//!     .expect("Failed to initialize client.");
//!
//! let instance = client.choose_server_instance(&ReadPreference::primary())
//!     .expect("No primary available.");
//!
//! let mut connection = instance.acquire_pooled(None).expect("Failed to acquire a connection.");
//! let reply = connection.run_command("admin", doc! { "buildInfo": 1 }).expect("Command failed.");
//! println!("{}", reply);
//! # }
//! ```
//!
//! ## Observing the topology
//!
//! Hooks registered on the listener see every instance and proxy state
//! change, ping time change and pool clear:
//!
//! ```no_run
//! # extern crate mongodb_topology;
//! # fn main() {
//! use mongodb_topology::Client;
//! use mongodb_topology::apm::ServerEvent;
//!
//! let client = Client::with_uri("mongodb://localhost:27017").unwrap();
//! client.add_event_hook(|event: &ServerEvent| println!("{}", event)).unwrap();
//! # }
//! ```
#[macro_use]
extern crate bitflags;
#[macro_use(bson, doc)]
extern crate bson;
extern crate bufstream;
extern crate byteorder;
extern crate chrono;
#[macro_use]
extern crate log;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate socket2;

pub mod apm;
pub mod auth;
pub mod common;
pub mod connection;
pub mod connstring;
pub mod error;
pub mod pool;
pub mod queue;
pub mod settings;
pub mod stream;
pub mod topology;
pub mod wire_protocol;

pub use error::{Error, Result};

use apm::ServerEvent;
use common::ServerSelector;
use settings::ServerSettings;
use topology::{Proxy, ProxyState, ServerContext, ServerInstance, ServerProxy};

use std::sync::Arc;
use std::time::Duration;

/// The name this library reports to servers in its handshake.
pub const DRIVER_NAME: &'static str = "mongodb-topology";

/// A handle to one logical server. Clones share the same proxy, instances
/// and pools.
#[derive(Clone, Debug)]
pub struct Client {
    context: Arc<ServerContext>,
    proxy: Arc<Proxy>,
}

impl Client {
    /// Creates a client that connects over TCP and speaks the wire protocol.
    pub fn new(settings: ServerSettings) -> Result<Client> {
        Client::with_context(ServerContext::new(settings))
    }

    /// Creates a client with custom collaborators.
    pub fn with_context(context: ServerContext) -> Result<Client> {
        let context = Arc::new(context);
        let proxy = Proxy::new(context.clone())?;
        Ok(Client {
            context: context,
            proxy: Arc::new(proxy),
        })
    }

    /// Creates a client from a MongoDB connection string URI as defined by
    /// [the manual](http://docs.mongodb.org/manual/reference/connection-string/).
    pub fn with_uri(uri: &str) -> Result<Client> {
        Client::new(ServerSettings::from_uri(uri)?)
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.context.settings
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    /// Registers a hook run on every server event.
    pub fn add_event_hook<F>(&self, hook: F) -> Result<()>
        where F: Fn(&ServerEvent) + Send + Sync + 'static
    {
        self.context.listener.add_hook(hook)
    }

    pub fn choose_server_instance(&self, selector: &dyn ServerSelector) -> Result<Arc<ServerInstance>> {
        self.proxy.choose_server_instance(selector)
    }

    /// Connects with the configured connect timeout.
    pub fn connect(&self, selector: &dyn ServerSelector) -> Result<()> {
        self.proxy.connect(self.context.settings.connect_timeout, selector)
    }

    pub fn connect_timeout(&self, timeout: Duration, selector: &dyn ServerSelector) -> Result<()> {
        self.proxy.connect(timeout, selector)
    }

    pub fn disconnect(&self) {
        self.proxy.disconnect()
    }

    pub fn ping(&self) -> Result<()> {
        self.proxy.ping()
    }

    pub fn verify_state(&self) -> Result<()> {
        self.proxy.verify_state()
    }

    pub fn state(&self) -> ProxyState {
        self.proxy.state()
    }

    pub fn instances(&self) -> Vec<Arc<ServerInstance>> {
        self.proxy.instances()
    }
}
