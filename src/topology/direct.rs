//! A proxy bound to exactly one instance, whatever its role.
use Result;

use common::ServerSelector;
use topology::{ProxyState, ServerContext, ServerProxy};
use topology::connector::DirectConnector;
use topology::instance::{ServerInstance, ServerState};

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct DirectProxy {
    instance: Arc<ServerInstance>,
    connect_timeout: Duration,
    connection_attempt: AtomicUsize,
    // Serializes reconnects so concurrent callers share one attempt.
    connecting: Mutex<()>,
}

impl DirectProxy {
    /// A proxy for the first configured host.
    pub fn new(context: Arc<ServerContext>) -> DirectProxy {
        let address = context.settings.hosts.first().cloned().unwrap_or_default();
        DirectProxy::with_instance(ServerInstance::new(address, context))
    }

    /// A proxy for an instance discovered elsewhere.
    pub fn with_instance(instance: Arc<ServerInstance>) -> DirectProxy {
        DirectProxy {
            connect_timeout: instance.context().settings.connect_timeout,
            instance: instance,
            connection_attempt: AtomicUsize::new(0),
            connecting: Mutex::new(()),
        }
    }

    pub fn instance(&self) -> &Arc<ServerInstance> {
        &self.instance
    }

    fn ensure_connected(&self, timeout: Duration) -> Result<()> {
        if self.instance.state() == ServerState::Connected {
            return Ok(());
        }

        let _guard = self.connecting.lock()?;
        if self.instance.state() == ServerState::Connected {
            return Ok(());
        }

        self.connection_attempt.fetch_add(1, Ordering::SeqCst);
        DirectConnector::new(timeout).connect(&self.instance)
    }
}

impl ServerProxy for DirectProxy {
    fn state(&self) -> ProxyState {
        ProxyState::from(self.instance.state())
    }

    fn instances(&self) -> Vec<Arc<ServerInstance>> {
        vec![self.instance.clone()]
    }

    fn connection_attempt(&self) -> usize {
        self.connection_attempt.load(Ordering::SeqCst)
    }

    fn replica_set_name(&self) -> Option<String> {
        self.instance.replica_set_information().map(|info| info.name)
    }

    fn primary(&self) -> Option<Arc<ServerInstance>> {
        if self.instance.is_primary() {
            Some(self.instance.clone())
        } else {
            None
        }
    }

    /// The single instance, reconnected if necessary. The selector is not
    /// consulted; a direct connection goes wherever it was pointed.
    fn choose_server_instance(&self, _: &dyn ServerSelector) -> Result<Arc<ServerInstance>> {
        self.ensure_connected(self.connect_timeout)?;
        Ok(self.instance.clone())
    }

    fn connect(&self, timeout: Duration, _: &dyn ServerSelector) -> Result<()> {
        self.ensure_connected(timeout)
    }

    fn disconnect(&self) {
        self.instance.disconnect();
    }

    fn ping(&self) -> Result<()> {
        self.instance.ping()
    }

    fn verify_state(&self) -> Result<()> {
        self.instance.verify_state()
    }
}
