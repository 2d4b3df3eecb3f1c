use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use apm::event::ServerEvent;
use Result;

pub type EventHook = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

/// A registry of event hooks shared by every part of one logical server.
pub struct Listener {
    no_hooks: AtomicBool,
    hooks: RwLock<Vec<EventHook>>,
}

impl Default for Listener {
    fn default() -> Self {
        Listener::new()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Listener")
            .field("hooks", &self.hooks.read().map(|hooks| hooks.len()).unwrap_or(0))
            .finish()
    }
}

impl Listener {
    pub fn new() -> Listener {
        Listener {
            no_hooks: AtomicBool::new(true),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_hook<F>(&self, hook: F) -> Result<()>
        where F: Fn(&ServerEvent) + Send + Sync + 'static
    {
        let mut guard = self.hooks.write()?;
        self.no_hooks.store(false, Ordering::SeqCst);
        guard.deref_mut().push(Arc::new(hook));
        Ok(())
    }

    /// Runs every hook with the event. A poisoned registry is skipped.
    pub fn emit(&self, event: &ServerEvent) {
        if self.no_hooks.load(Ordering::SeqCst) {
            return;
        }

        // Clone the hooks out so a hook may register another one.
        let hooks: Vec<EventHook> = match self.hooks.read() {
            Ok(guard) => guard.deref().clone(),
            Err(_) => return,
        };

        for hook in &hooks {
            hook(event);
        }
    }
}
