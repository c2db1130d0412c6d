use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identifier handed out by [`ShutdownCoordinator::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    SegmentWriter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Running,
    Stopped,
}

/// Priority recording workers register with.
pub const WRITER_PRIORITY: u8 = 10;

/// Process-wide cooperative shutdown, polled by the recording workers.
pub trait ShutdownCoordinator: Send + Sync {
    fn is_shutdown_initiated(&self) -> bool;

    /// Register a component for shutdown tracking. `None` means registration
    /// failed; the caller keeps running but state updates are skipped.
    fn register(&self, name: &str, kind: ComponentKind, priority: u8) -> Option<ComponentId>;

    fn update_state(&self, id: ComponentId, state: ComponentState);
}

struct Component {
    name: String,
    state: ComponentState,
}

/// Default coordinator: a process-wide flag plus a component table. The CLI
/// flips the flag from its signal handler.
#[derive(Default)]
pub struct SignalShutdown {
    initiated: AtomicBool,
    components: Mutex<Vec<Component>>,
}

impl SignalShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initiate(&self) {
        self.initiated.store(true, Ordering::SeqCst);
    }

    pub fn component_state(&self, id: ComponentId) -> Option<ComponentState> {
        self.components.lock().unwrap().get(id.0).map(|c| c.state)
    }

    /// Names of registered components that have not reached STOPPED yet.
    pub fn running_components(&self) -> Vec<String> {
        self.components
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.state != ComponentState::Stopped)
            .map(|c| c.name.clone())
            .collect()
    }
}

impl ShutdownCoordinator for SignalShutdown {
    fn is_shutdown_initiated(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    fn register(&self, name: &str, kind: ComponentKind, priority: u8) -> Option<ComponentId> {
        let mut components = self.components.lock().unwrap();
        components.push(Component {
            name: name.to_string(),
            state: ComponentState::Running,
        });
        let id = ComponentId(components.len() - 1);
        log::debug!("registered component {name} ({kind:?}, priority {priority}) as id {}", id.0);
        Some(id)
    }

    fn update_state(&self, id: ComponentId, state: ComponentState) {
        let mut components = self.components.lock().unwrap();
        if let Some(component) = components.get_mut(id.0) {
            component.state = state;
        } else {
            log::warn!("state update for unknown component id {}", id.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_update() {
        let shutdown = SignalShutdown::new();
        let id = shutdown
            .register("cam1", ComponentKind::SegmentWriter, WRITER_PRIORITY)
            .unwrap();
        assert_eq!(shutdown.component_state(id), Some(ComponentState::Running));
        shutdown.update_state(id, ComponentState::Stopped);
        assert_eq!(shutdown.component_state(id), Some(ComponentState::Stopped));
    }

    #[test]
    fn initiate_flips_flag() {
        let shutdown = SignalShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
        shutdown.initiate();
        assert!(shutdown.is_shutdown_initiated());
    }
}
