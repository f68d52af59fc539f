//! Handler registry.
//!
//! The [`Registry`] stores handler definitions keyed by kind and name. It is
//! pure bookkeeping: no execution logic lives here.
//!
//! # Concurrency
//!
//! The registry is read-mostly shared state. Lookups load an immutable
//! snapshot through [`ArcSwap`] and never take a lock; registrations are
//! serialized by a writer mutex and publish a new snapshot atomically, so a
//! reader observes either the old table or the new one, never a partially
//! written entry.
//!
//! # Re-registration
//!
//! In the default [`RegistryMode::Overwrite`] mode, registering a name that
//! already exists for the same kind replaces the previous entry (last write
//! wins). [`RegistryMode::Strict`] rejects it with
//! [`RpcError::DuplicateNotAllowed`] instead.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::delivery::{DeliveryMode, RetryPolicy};
use crate::error::{RpcError, RpcResult};
use crate::handler::{BoxedEventHandler, BoxedProcedureHandler, BoxedStreamHandler};

/// The three handler kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Procedure,
    Stream,
    Event,
}

impl HandlerKind {
    pub const ALL: [HandlerKind; 3] = [Self::Procedure, Self::Stream, Self::Event];

    fn index(self) -> usize {
        match self {
            Self::Procedure => 0,
            Self::Stream => 1,
            Self::Event => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Procedure => "procedure",
            Self::Stream => "stream",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the registry treats a second registration under an existing name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryMode {
    /// Replace the existing entry (last write wins).
    #[default]
    Overwrite,
    /// Reject the registration with `DuplicateNotAllowed`.
    Strict,
}

// =============================================================================
// Entries
// =============================================================================

/// Descriptive metadata for procedure and stream handlers.
#[derive(Debug, Clone, Default)]
pub struct HandlerMeta {
    pub description: Option<String>,
}

impl HandlerMeta {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
        }
    }
}

/// Metadata for event handlers, including the delivery contract.
#[derive(Debug, Clone, Default)]
pub struct EventMeta {
    pub description: Option<String>,
    /// Delivery guarantee applied to every event dispatched to this handler.
    pub delivery: DeliveryMode,
    /// Retry policy for at-least-once delivery; engine default when `None`.
    pub retry_policy: Option<RetryPolicy>,
    /// Deduplication window for at-most-once delivery; engine default when `None`.
    pub deduplication_window: Option<Duration>,
}

impl EventMeta {
    /// Metadata with the given delivery mode and defaults elsewhere.
    pub fn new(delivery: DeliveryMode) -> Self {
        Self {
            delivery,
            ..Self::default()
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_deduplication_window(mut self, window: Duration) -> Self {
        self.deduplication_window = Some(window);
        self
    }
}

/// A registered handler.
#[derive(Clone)]
pub enum HandlerEntry {
    Procedure {
        name: String,
        handler: BoxedProcedureHandler,
        meta: HandlerMeta,
    },
    Stream {
        name: String,
        handler: BoxedStreamHandler,
        meta: HandlerMeta,
    },
    Event {
        name: String,
        handler: BoxedEventHandler,
        meta: EventMeta,
    },
}

impl HandlerEntry {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Procedure { .. } => HandlerKind::Procedure,
            Self::Stream { .. } => HandlerKind::Stream,
            Self::Event { .. } => HandlerKind::Event,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Procedure { name, .. } | Self::Stream { name, .. } | Self::Event { name, .. } => {
                name
            }
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Self::Procedure { meta, .. } | Self::Stream { meta, .. } => meta.description.as_deref(),
            Self::Event { meta, .. } => meta.description.as_deref(),
        }
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("description", &self.description())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Clone, Default)]
struct Table {
    by_kind: [HashMap<String, Arc<HandlerEntry>>; 3],
}

/// Thread-safe handler registry.
pub struct Registry {
    mode: RegistryMode,
    table: ArcSwap<Table>,
    /// Serializes writers; readers never touch it.
    write_lock: Mutex<()>,
}

impl Registry {
    /// Creates an empty registry in the given mode.
    pub fn new(mode: RegistryMode) -> Self {
        Self {
            mode,
            table: ArcSwap::from_pointee(Table::default()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn mode(&self) -> RegistryMode {
        self.mode
    }

    /// Registers an entry, returning the entry it replaced, if any.
    pub fn register(&self, entry: HandlerEntry) -> RpcResult<Option<Arc<HandlerEntry>>> {
        let kind = entry.kind();
        let name = entry.name().to_string();

        let _guard = self.write_lock.lock();
        let current = self.table.load_full();

        if self.mode == RegistryMode::Strict && current.by_kind[kind.index()].contains_key(&name) {
            return Err(RpcError::DuplicateNotAllowed { kind, name });
        }

        let mut next = (*current).clone();
        let replaced = next.by_kind[kind.index()].insert(name.clone(), Arc::new(entry));
        self.table.store(Arc::new(next));

        if replaced.is_some() {
            debug!(%kind, %name, "Replaced handler");
        } else {
            debug!(%kind, %name, "Registered handler");
        }
        Ok(replaced)
    }

    /// Removes an entry, returning it if it existed.
    pub fn unregister(&self, kind: HandlerKind, name: &str) -> Option<Arc<HandlerEntry>> {
        let _guard = self.write_lock.lock();
        let current = self.table.load_full();
        if !current.by_kind[kind.index()].contains_key(name) {
            return None;
        }

        let mut next = (*current).clone();
        let removed = next.by_kind[kind.index()].remove(name);
        self.table.store(Arc::new(next));
        debug!(%kind, %name, "Unregistered handler");
        removed
    }

    /// Looks up an entry by kind and name.
    pub fn lookup(&self, kind: HandlerKind, name: &str) -> Option<Arc<HandlerEntry>> {
        self.table.load().by_kind[kind.index()].get(name).cloned()
    }

    /// Returns the registered names for a kind, sorted.
    pub fn names(&self, kind: HandlerKind) -> Vec<String> {
        let mut names: Vec<String> = self.table.load().by_kind[kind.index()]
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Returns statistics about the registry.
    pub fn stats(&self) -> RegistryStats {
        let table = self.table.load();
        RegistryStats {
            procedures: table.by_kind[HandlerKind::Procedure.index()].len(),
            streams: table.by_kind[HandlerKind::Stream.index()].len(),
            events: table.by_kind[HandlerKind::Event.index()].len(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(RegistryMode::default())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("mode", &self.mode)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Statistics about the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub procedures: usize,
    pub streams: usize,
    pub events: usize,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} procedure(s), {} stream(s), {} event(s)",
            self.procedures, self.streams, self.events
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use serde_json::{Value, json};
    use std::thread;

    fn procedure(name: &str, reply: &'static str) -> HandlerEntry {
        HandlerEntry::Procedure {
            name: name.to_string(),
            handler: Arc::new(move |_payload: Value, _ctx: Context| async move {
                Ok::<_, RpcError>(json!(reply))
            }),
            meta: HandlerMeta::default(),
        }
    }

    async fn call(entry: &HandlerEntry) -> Value {
        match entry {
            HandlerEntry::Procedure { handler, .. } => {
                handler.call(Value::Null, Context::new()).await.unwrap()
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overwrite_is_last_write_wins() {
        let registry = Registry::default();
        assert!(registry.register(procedure("greet", "first")).unwrap().is_none());
        let replaced = registry.register(procedure("greet", "second")).unwrap();
        assert!(replaced.is_some());

        let entry = registry.lookup(HandlerKind::Procedure, "greet").unwrap();
        assert_eq!(call(&entry).await, json!("second"));
        assert_eq!(registry.stats().procedures, 1);
    }

    #[test]
    fn test_strict_mode_rejects_duplicates() {
        let registry = Registry::new(RegistryMode::Strict);
        registry.register(procedure("greet", "first")).unwrap();
        let err = registry.register(procedure("greet", "second")).unwrap_err();
        assert!(matches!(err, RpcError::DuplicateNotAllowed { kind: HandlerKind::Procedure, .. }));
    }

    #[test]
    fn test_names_are_per_kind() {
        let registry = Registry::new(RegistryMode::Strict);
        registry.register(procedure("ping", "pong")).unwrap();
        registry
            .register(HandlerEntry::Stream {
                name: "ping".into(),
                handler: Arc::new(|_p: Value, _c: Context| {
                    futures::stream::empty::<RpcResult<Value>>()
                }),
                meta: HandlerMeta::described("a stream named like a procedure"),
            })
            .unwrap();

        assert!(registry.lookup(HandlerKind::Stream, "ping").is_some());
        assert!(registry.lookup(HandlerKind::Event, "ping").is_none());
        assert_eq!(
            registry.lookup(HandlerKind::Stream, "ping").unwrap().description(),
            Some("a stream named like a procedure")
        );
    }

    #[test]
    fn test_unregister() {
        let registry = Registry::default();
        registry.register(procedure("a", "a")).unwrap();
        assert!(registry.unregister(HandlerKind::Procedure, "a").is_some());
        assert!(registry.unregister(HandlerKind::Procedure, "a").is_none());
        assert!(registry.names(HandlerKind::Procedure).is_empty());
    }

    #[test]
    fn test_concurrent_register_and_lookup() {
        let registry = Arc::new(Registry::default());
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..50 {
                        registry.register(procedure(&format!("p{t}.{i}"), "x")).unwrap();
                    }
                })
            })
            .collect();
        let reader = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for _ in 0..200 {
                    for name in registry.names(HandlerKind::Procedure) {
                        let entry = registry.lookup(HandlerKind::Procedure, &name).unwrap();
                        assert_eq!(entry.name(), name);
                    }
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(registry.stats().procedures, 200);
    }
}
