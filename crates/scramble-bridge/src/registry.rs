//! Entry points the module registers with the host.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Token a module assigns to one of its entry points when registering.
///
/// Opaque to the host. It is handed back to the module's dispatch export to
/// select the entry point being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryToken(pub i32);

/// The named entry points a module instance has registered so far.
///
/// Populated exclusively by the module through its runtime imports; the host
/// side only reads. Names are never removed for the lifetime of the
/// instance, so the visible set grows monotonically. One registry is shared
/// between the bridge facade, the readiness gate, and the host function
/// table of a single instance.
#[derive(Debug, Default)]
pub struct EntryPointRegistry {
    entries: RwLock<HashMap<String, EntryToken>>,
}

impl EntryPointRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a registration. Registering a name twice keeps the newest
    /// token; the name itself never disappears.
    pub fn register(&self, name: impl Into<String>, token: EntryToken) {
        let name = name.into();
        let previous = self.entries.write().insert(name.clone(), token);
        if let Some(old) = previous {
            tracing::debug!(entry = %name, ?old, new = ?token, "entry point re-registered");
        } else {
            tracing::debug!(entry = %name, ?token, "entry point registered");
        }
    }

    /// Token registered under `name`, if any.
    pub fn lookup(&self, name: &str) -> Option<EntryToken> {
        self.entries.read().get(name).copied()
    }

    /// Whether `name` has been registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Names from `required` that have not been registered yet.
    pub fn missing<'a, I>(&self, required: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let entries = self.entries.read();
        required
            .into_iter()
            .filter(|name| !entries.contains_key(name.as_str()))
            .cloned()
            .collect()
    }

    /// All registered names, unordered.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Number of registered entry points.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn register_then_lookup() {
        let registry = EntryPointRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.lookup("transform"), None);

        registry.register("transform", EntryToken(1));
        assert_eq!(registry.lookup("transform"), Some(EntryToken(1)));
        assert!(registry.contains("transform"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn re_registration_keeps_newest_token() {
        let registry = EntryPointRegistry::new();
        registry.register("transform", EntryToken(1));
        registry.register("transform", EntryToken(9));
        assert_eq!(registry.lookup("transform"), Some(EntryToken(9)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn missing_filters_registered_names() {
        let registry = EntryPointRegistry::new();
        let required = vec!["transform".to_string(), "selfTest".to_string()];
        assert_eq!(registry.missing(&required), required);

        registry.register("selfTest", EntryToken(2));
        assert_eq!(registry.missing(&required), vec!["transform".to_string()]);

        registry.register("transform", EntryToken(1));
        assert!(registry.missing(&required).is_empty());
    }

    #[test]
    fn shared_across_threads() {
        let registry = Arc::new(EntryPointRegistry::new());
        let writer = Arc::clone(&registry);
        let handle = std::thread::spawn(move || {
            writer.register("transform", EntryToken(7));
        });
        handle.join().expect("join writer");
        assert_eq!(registry.lookup("transform"), Some(EntryToken(7)));
    }
}
