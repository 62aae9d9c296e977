//! # Shared Link Registry
//!
//! A connection pool of size one. Every manager that should share a single
//! presence socket is handed the same `LinkRegistry`; the first one to open a
//! link claims the slot, and any other manager that wants to connect while
//! that link is open adopts it instead of opening a second socket.
//!
//! The owner keeps the registry informed (`claim`, `mark_open`, `release`) and
//! republishes every inbound frame, so adopters see the same traffic. Only the
//! owner ever closes the socket.
//!
//! Tests build independent registries with [`LinkRegistry::new`]; binaries
//! usually share [`LinkRegistry::global`], created at process start.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use static_init::dynamic;
use tokio::sync::broadcast;

use crate::transport::{LinkId, TransportHandle};

/// Identifies one connection manager.
pub type ManagerId = u64;

const SHARED_EVENT_CAPACITY: usize = 256;

/// Process-wide registry for callers that do not inject their own.
#[dynamic]
static GLOBAL_REGISTRY: LinkRegistry = LinkRegistry::new();

/// Lifecycle and traffic of the shared link, as seen by adopters.
#[derive(Debug, Clone)]
pub enum SharedLinkEvent {
    /// The owner's link finished opening.
    Opened {
        /// Manager that owns the link.
        owner: ManagerId,
    },
    /// The owner received a text frame.
    Frame {
        /// Manager that owns the link.
        owner: ManagerId,
        /// Frame body.
        text: Arc<str>,
    },
    /// The owner's link is gone.
    Closed {
        /// Manager that owned the link.
        owner: ManagerId,
        /// Close code the owner observed.
        code: u16,
        /// Close reason the owner observed.
        reason: String,
    },
}

struct Slot {
    owner: ManagerId,
    link: LinkId,
    handle: TransportHandle,
    open: bool,
}

struct RegistryInner {
    slot: Mutex<Option<Slot>>,
    events: broadcast::Sender<SharedLinkEvent>,
    next_manager: AtomicU64,
}

/// Size-one pool of presence links.
#[derive(Clone)]
pub struct LinkRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for LinkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(SHARED_EVENT_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                slot: Mutex::new(None),
                events,
                next_manager: AtomicU64::new(1),
            }),
        }
    }

    /// The process-wide registry.
    pub fn global() -> LinkRegistry {
        GLOBAL_REGISTRY.clone()
    }

    /// Hands out a fresh manager id.
    pub(crate) fn register_manager(&self) -> ManagerId {
        self.inner.next_manager.fetch_add(1, Ordering::Relaxed)
    }

    /// Records `owner`'s newly created link as the process-wide one.
    pub fn claim(&self, owner: ManagerId, link: LinkId, handle: TransportHandle) {
        let mut slot = self.inner.slot.lock().expect("Registry lock poisoned");
        if let Some(previous) = slot.as_ref() {
            if previous.owner != owner {
                log::warn!(
                    "Manager {} replaces manager {} as shared link owner while it is still connecting",
                    owner,
                    previous.owner
                );
            }
        }
        *slot = Some(Slot {
            owner,
            link,
            handle,
            open: false,
        });
    }

    /// Marks the claimed link as open. Ignored if the slot moved on.
    pub fn mark_open(&self, owner: ManagerId, link: LinkId) -> bool {
        let mut slot = self.inner.slot.lock().expect("Registry lock poisoned");
        match slot.as_mut() {
            Some(s) if s.owner == owner && s.link == link => {
                s.open = true;
                drop(slot);
                let _ = self.inner.events.send(SharedLinkEvent::Opened { owner });
                true
            }
            _ => false,
        }
    }

    /// Clears the slot if it still refers to `owner`'s `link`, telling
    /// adopters how the link ended.
    pub fn release(&self, owner: ManagerId, link: LinkId, code: u16, reason: &str) -> bool {
        let mut slot = self.inner.slot.lock().expect("Registry lock poisoned");
        let matches = slot.as_ref().is_some_and(|s| s.owner == owner && s.link == link);
        if matches {
            *slot = None;
            drop(slot);
            log::debug!("Shared link {} released by manager {}", link, owner);
            let _ = self.inner.events.send(SharedLinkEvent::Closed {
                owner,
                code,
                reason: reason.to_string(),
            });
        }
        matches
    }

    /// The open link owned by someone other than `requester`, if any.
    pub fn open_link(&self, requester: ManagerId) -> Option<TransportHandle> {
        let slot = self.inner.slot.lock().expect("Registry lock poisoned");
        slot.as_ref()
            .filter(|s| s.open && s.owner != requester && s.handle.is_alive())
            .map(|s| s.handle.clone())
    }

    /// Whether any link, open or opening, is registered.
    pub fn is_occupied(&self) -> bool {
        self.inner.slot.lock().expect("Registry lock poisoned").is_some()
    }

    /// Republishes a frame received by the owner.
    pub fn publish(&self, owner: ManagerId, text: &str) {
        if self.inner.events.receiver_count() > 0 {
            let _ = self.inner.events.send(SharedLinkEvent::Frame {
                owner,
                text: Arc::from(text),
            });
        }
    }

    /// Subscribes to shared link events.
    pub fn subscribe(&self) -> broadcast::Receiver<SharedLinkEvent> {
        self.inner.events.subscribe()
    }
}
