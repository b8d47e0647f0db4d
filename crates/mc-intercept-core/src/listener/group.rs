//! Named sets of listeners that are switched on and off together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use super::{ListenerKey, ListenerPipeline, PacketListener};
use crate::error::InterceptError;

pub struct ListenerGroup {
    name: String,
    pipeline: Arc<ListenerPipeline>,
    listeners: Mutex<Vec<Arc<dyn PacketListener>>>,
    enabled: AtomicBool,
}

impl ListenerGroup {
    pub fn new(name: impl Into<String>, pipeline: Arc<ListenerPipeline>) -> Self {
        Self {
            name: name.into(),
            pipeline,
            listeners: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a listener; it is registered right away if the group is enabled.
    pub fn add(&self, listener: Arc<dyn PacketListener>) -> Result<(), InterceptError> {
        if self.is_enabled() {
            self.pipeline.register(listener.clone())?;
        }
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(listener);
        }
        Ok(())
    }

    pub fn remove(&self, listener: &Arc<dyn PacketListener>) -> bool {
        let key = ListenerKey::of(listener);
        self.pipeline.unregister_key(key);
        match self.listeners.lock() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|l| ListenerKey::of(l) != key);
                listeners.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn enable(&self) {
        if self.enabled.swap(true, Ordering::AcqRel) {
            return;
        }
        for listener in self.snapshot() {
            // Listeners registered elsewhere in the meantime stay where they are.
            let _ = self.pipeline.register(listener);
        }
        info!("Listener group '{}' enabled", self.name);
    }

    pub fn disable(&self) {
        if !self.enabled.swap(false, Ordering::AcqRel) {
            return;
        }
        for listener in self.snapshot() {
            self.pipeline.unregister(&listener);
        }
        info!("Listener group '{}' disabled", self.name);
    }

    /// Unregister and re-register every member, picking up changed priorities or filters.
    pub fn reload(&self) {
        self.disable();
        self.enable();
    }

    /// Disable and forget every member.
    pub fn unregister_all(&self) {
        self.disable();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.clear();
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn PacketListener>> {
        self.listeners.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LogErrorSink;

    struct Quiet(&'static str);

    impl PacketListener for Quiet {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn enable_disable_toggles_registration() {
        let pipeline = Arc::new(ListenerPipeline::new(Arc::new(LogErrorSink)));
        let group = ListenerGroup::new("anticheat", pipeline.clone());
        group.add(Arc::new(Quiet("a"))).unwrap();
        group.add(Arc::new(Quiet("b"))).unwrap();
        assert_eq!(pipeline.len(), 2);

        group.disable();
        assert!(pipeline.is_empty());
        assert_eq!(group.len(), 2);

        // Added while disabled: remembered, not registered.
        group.add(Arc::new(Quiet("c"))).unwrap();
        assert!(pipeline.is_empty());

        group.enable();
        assert_eq!(pipeline.len(), 3);

        group.reload();
        assert_eq!(pipeline.len(), 3);

        group.unregister_all();
        assert!(pipeline.is_empty());
        assert!(group.is_empty());
    }

    #[test]
    fn remove_unregisters_member() {
        let pipeline = Arc::new(ListenerPipeline::new(Arc::new(LogErrorSink)));
        let group = ListenerGroup::new("g", pipeline.clone());
        let listener: Arc<dyn PacketListener> = Arc::new(Quiet("x"));
        group.add(listener.clone()).unwrap();
        assert!(group.remove(&listener));
        assert!(!group.remove(&listener));
        assert!(pipeline.is_empty());
    }
}
