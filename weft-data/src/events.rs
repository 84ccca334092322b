//! Mutation event relays.
//!
//! Every hashed object lazily owns an [`EventRelay`]. Relays chain: a parent
//! adds its direct subobjects' relays as children, keyed by field name, so an
//! observer attached at the root sees mutation events from any descendant
//! with the path to the emitter prefixed on.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use weft_base::{Hash, Value};

/// One observed mutation.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    /// Hash of the emitting object.
    pub emitter: Hash,
    /// What happened (class-specific action tag).
    pub action: String,
    /// Field path from the observation point down to the emitter.
    pub path: Vec<String>,
    /// Whether this is a content-level event (an element changed inside a
    /// mutable) rather than a structural one.
    pub content: bool,
    /// Optional payload.
    pub data: Option<Value>,
}

/// Observer callback.
pub type Observer = Arc<dyn Fn(&MutationEvent) + Send + Sync>;

struct RelayInner {
    next_id: u64,
    observers: Vec<(u64, Observer)>,
    children: HashMap<String, (Arc<EventRelay>, u64)>,
    cascade_content: bool,
}

/// Relay for mutation events, chainable along the object graph.
pub struct EventRelay {
    inner: Mutex<RelayInner>,
}

impl std::fmt::Debug for EventRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "EventRelay(observers={}, children={})",
            inner.observers.len(),
            inner.children.len()
        )
    }
}

impl EventRelay {
    /// Create a relay.
    pub fn new_arc() -> Arc<Self> {
        Arc::new(EventRelay {
            inner: Mutex::new(RelayInner {
                next_id: 0,
                observers: Vec::new(),
                children: HashMap::new(),
                cascade_content: true,
            }),
        })
    }

    /// Attach an observer. Returns a token for removal.
    pub fn add_observer(&self, observer: Observer) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.observers.push((id, observer));
        id
    }

    /// Remove an observer by token.
    pub fn remove_observer(&self, token: u64) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(id, _)| *id != token);
        inner.observers.len() != before
    }

    /// Emit an event to all observers, in attachment order.
    pub fn emit(&self, event: &MutationEvent) {
        let observers: Vec<Observer> = self
            .inner
            .lock()
            .observers
            .iter()
            .map(|(_, obs)| obs.clone())
            .collect();
        for observer in observers {
            observer(event);
        }
    }

    /// Chain a child relay under a field name. Events emitted through the
    /// child reach this relay's observers with `field` prefixed to the path.
    pub fn add_child(self: &Arc<Self>, field: impl Into<String>, child: Arc<EventRelay>) {
        let field = field.into();
        let parent = Arc::downgrade(self);
        let prefix = field.clone();
        let token = child.add_observer(Arc::new(move |event| {
            forward(&parent, &prefix, event);
        }));
        let mut inner = self.inner.lock();
        if let Some((old_child, old_token)) = inner.children.insert(field, (child, token)) {
            old_child.remove_observer(old_token);
        }
    }

    /// Detach the child relay under a field name.
    pub fn remove_child(&self, field: &str) -> bool {
        let removed = self.inner.lock().children.remove(field);
        match removed {
            Some((child, token)) => {
                child.remove_observer(token);
                true
            }
            None => false,
        }
    }

    /// Enable or disable propagation of content-level events from children,
    /// recursively.
    pub fn set_cascade_mutable_content_events(&self, enabled: bool) {
        let children: Vec<Arc<EventRelay>> = {
            let mut inner = self.inner.lock();
            inner.cascade_content = enabled;
            inner
                .children
                .values()
                .map(|(child, _)| child.clone())
                .collect()
        };
        for child in children {
            child.set_cascade_mutable_content_events(enabled);
        }
    }

    fn cascades_content(&self) -> bool {
        self.inner.lock().cascade_content
    }
}

fn forward(parent: &Weak<EventRelay>, prefix: &str, event: &MutationEvent) {
    let Some(parent) = parent.upgrade() else {
        return;
    };
    if event.content && !parent.cascades_content() {
        return;
    }
    let mut forwarded = event.clone();
    forwarded.path.insert(0, prefix.to_string());
    parent.emit(&forwarded);
}
