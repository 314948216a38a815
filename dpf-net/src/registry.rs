//! Remote object handles and the per-session registry tracking the ones the
//! client is responsible for releasing.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

use fnv::FnvHashMap;

use dpf_core::{EntityId, ObjectKind};

use crate::msg::{DuplicateReferenceRequest, EntityRef};
use crate::session::{Session, SessionInner};
use crate::{Error, Result};

/// Ids of the owned handles of a session, remembered in registration order.
#[derive(Default)]
pub(crate) struct HandleRegistry {
    owned: Mutex<FnvHashMap<EntityId, u64>>,
    counter: AtomicU64,
}

impl HandleRegistry {
    pub fn insert(&self, id: EntityId) {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        match self.owned.lock() {
            Ok(mut owned) => {
                owned.insert(id, seq);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id, seq);
            }
        }
    }

    /// Removes the id, returning true if it was registered.
    pub fn remove(&self, id: EntityId) -> bool {
        match self.owned.lock() {
            Ok(mut owned) => owned.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
        }
    }

    pub fn contains(&self, id: EntityId) -> bool {
        match self.owned.lock() {
            Ok(owned) => owned.contains_key(&id),
            Err(poisoned) => poisoned.into_inner().contains_key(&id),
        }
    }

    pub fn len(&self) -> usize {
        match self.owned.lock() {
            Ok(owned) => owned.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Empties the registry, returning the ids newest first.
    pub fn drain_newest_first(&self) -> Vec<EntityId> {
        let drained: Vec<(EntityId, u64)> = match self.owned.lock() {
            Ok(mut owned) => owned.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        };
        let mut drained = drained;
        drained.sort_by(|a, b| b.1.cmp(&a.1));
        drained.into_iter().map(|(id, _)| id).collect()
    }
}

/// Client-side reference to a server-side object.
///
/// An owned handle releases the server object when dropped. A borrowed one
/// doesn't. Handles keep only a weak reference to their session; once the
/// session is gone dropping a handle does nothing.
pub struct Handle {
    id: EntityId,
    kind: ObjectKind,
    owned: AtomicBool,
    session: Weak<SessionInner>,
}

impl Handle {
    /// Creates an owned handle and records it in the session registry.
    pub(crate) fn register(session: &Session, kind: ObjectKind, id: EntityId) -> Self {
        session.inner().registry.insert(id);
        debug!("registered owned {} handle {}", kind, id);
        Self {
            id,
            kind,
            owned: AtomicBool::new(true),
            session: session.downgrade(),
        }
    }

    /// Creates a borrowed handle. Nothing is recorded and nothing is
    /// released on drop.
    pub(crate) fn wrap_borrowed(session: &Session, kind: ObjectKind, id: EntityId) -> Self {
        Self {
            id,
            kind,
            owned: AtomicBool::new(false),
            session: session.downgrade(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_owned(&self) -> bool {
        self.owned.load(Ordering::SeqCst)
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            id: self.id,
            kind: self.kind,
        }
    }

    /// Returns the session this handle belongs to.
    pub fn session(&self) -> Result<Session> {
        Session::upgrade(&self.session).ok_or_else(|| {
            Error::TransportUnavailable(format!(
                "session owning {} handle {} was shut down",
                self.kind, self.id
            ))
        })
    }

    pub(crate) fn belongs_to(&self, session: &Session) -> bool {
        Weak::ptr_eq(&self.session, &session.downgrade())
    }

    /// Gives up responsibility for releasing the server object, returning its
    /// id so that another owner can take over. Calling this more than once
    /// returns the same id and has no further effect.
    pub fn take_ownership(&self) -> EntityId {
        if self.owned.swap(false, Ordering::SeqCst) {
            if let Some(inner) = self.session.upgrade() {
                inner.registry.remove(self.id);
            }
            debug!("ownership of {} handle {} transferred", self.kind, self.id);
        }
        self.id
    }

    /// Asks the server for a new, independently counted reference to the
    /// same object. The returned handle is owned.
    pub fn duplicate_reference(&self) -> Result<Handle> {
        let session = self.session()?;
        let entity = session.rpc(&DuplicateReferenceRequest { id: self.id })?;
        Ok(Handle::register(&session, self.kind, entity.id))
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.owned.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.session.upgrade() {
            // a session being torn down has already drained its registry
            if inner.registry.remove(self.id) {
                // the server may hand the id out again
                inner.cache.invalidate(self.id);
                inner.release(self.id);
            }
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("owned", &self.is_owned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_returns_newest_first() {
        let registry = HandleRegistry::default();
        registry.insert(10);
        registry.insert(3);
        registry.insert(7);
        assert!(registry.remove(3));
        assert!(!registry.remove(3));
        assert_eq!(registry.drain_newest_first(), vec![7, 10]);
        assert_eq!(registry.len(), 0);
    }
}
