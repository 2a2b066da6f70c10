//! The single shared object model and its scoped access.
//!
//! Each task that needs the model owns a [`ModelHandle`]. Both [`ModelHandle::read`]
//! and [`ModelHandle::write`] borrow the handle mutably for the lifetime of the
//! returned scope, so one actor can never hold two scopes at once: a nested
//! acquisition from the same handle is rejected by the borrow checker instead of
//! deadlocking at runtime. Scopes release their lock when dropped, on every exit
//! path.

use super::patch::{diff, merge, strip_nulls};
use super::{ObjectModel, module_key};
use serde_json::Value;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard, watch};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unknown object model module {0}")]
    UnknownModule(u8),
    #[error("Invalid property path '{0}'")]
    InvalidPath(String),
}

struct Shared {
    model: RwLock<ObjectModel>,
    revision: watch::Sender<u64>,
}

/// Owner of the authoritative document. Cloning shares the same document.
#[derive(Clone)]
pub struct ModelStore {
    shared: Arc<Shared>,
}

impl ModelStore {
    pub fn new(model: ObjectModel) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                model: RwLock::new(model),
                revision,
            }),
        }
    }

    /// Access handle for one logical actor.
    pub fn handle(&self) -> ModelHandle {
        ModelHandle { shared: self.shared.clone() }
    }

    /// Receiver bumped after every write scope that changed the document.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::new(ObjectModel::default())
    }
}

/// Per-actor access point to the model. Deliberately not `Clone`.
pub struct ModelHandle {
    shared: Arc<Shared>,
}

impl ModelHandle {
    pub async fn read(&mut self) -> ReadScope<'_> {
        ReadScope { guard: self.shared.model.read().await }
    }

    pub async fn write(&mut self) -> WriteScope<'_> {
        WriteScope {
            guard: self.shared.model.write().await,
            bump: RevisionBump {
                revision: &self.shared.revision,
                dirty: false,
            },
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    pub async fn snapshot(&mut self) -> Result<Value, ModelError> {
        self.read().await.snapshot()
    }

    /// Merge a firmware object model chunk. Module 0 addresses the whole
    /// document, other modules a single sub-model. On failure the model is
    /// left unchanged.
    pub async fn apply_firmware_update(&mut self, module: u8, payload: &str) -> Result<(), ModelError> {
        let key = module_key(module).ok_or(ModelError::UnknownModule(module))?;
        let patch: Value = serde_json::from_str(payload)?;
        let mut scope = self.write().await;
        let mut doc = serde_json::to_value(&*scope)?;
        match key {
            None => merge(&mut doc, &patch),
            Some(key) => {
                let mut wrapped = serde_json::Map::new();
                wrapped.insert(key.to_string(), patch);
                merge(&mut doc, &Value::Object(wrapped));
            }
        }
        let updated: ObjectModel = serde_json::from_value(doc)?;
        *scope = updated;
        Ok(())
    }

    /// Set a single property addressed by a `/` or `.` separated path. A `null`
    /// value removes the property.
    pub async fn set_property(&mut self, path: &str, mut value: Value) -> Result<(), ModelError> {
        let segments: Vec<&str> = path.split(['/', '.']).filter(|s| !s.is_empty()).collect();
        let Some((last, parents)) = segments.split_last() else {
            return Err(ModelError::InvalidPath(path.to_string()));
        };
        strip_nulls(&mut value);

        let mut scope = self.write().await;
        let mut doc = serde_json::to_value(&*scope)?;
        let mut node = &mut doc;
        for segment in parents {
            node = match node {
                Value::Object(map) => map.get_mut(*segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
                _ => None,
            }
            .ok_or_else(|| ModelError::InvalidPath(path.to_string()))?;
        }
        match node {
            Value::Object(map) if value.is_null() => {
                map.remove(*last);
            }
            Value::Object(map) => {
                map.insert(last.to_string(), value);
            }
            Value::Array(items) => {
                let slot = last
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or_else(|| ModelError::InvalidPath(path.to_string()))?;
                *slot = value;
            }
            _ => return Err(ModelError::InvalidPath(path.to_string())),
        }
        let updated: ObjectModel = serde_json::from_value(doc)?;
        *scope = updated;
        Ok(())
    }
}

/// Shared read access; released on drop.
pub struct ReadScope<'a> {
    guard: RwLockReadGuard<'a, ObjectModel>,
}

impl ReadScope<'_> {
    /// The document as JSON. Absent values are left out rather than sent as
    /// `null`, which patches reserve for removed keys.
    pub fn snapshot(&self) -> Result<Value, ModelError> {
        let mut doc = serde_json::to_value(&*self.guard)?;
        strip_nulls(&mut doc);
        Ok(doc)
    }

    /// Patch from `baseline` to the current document, `None` if unchanged.
    pub fn diff_since(&self, baseline: &Value) -> Result<Option<Value>, ModelError> {
        Ok(diff(baseline, &self.snapshot()?))
    }
}

impl Deref for ReadScope<'_> {
    type Target = ObjectModel;

    fn deref(&self) -> &ObjectModel {
        &self.guard
    }
}

/// Exclusive write access; released on drop. Subscribers are notified after
/// the lock is released if the document was borrowed mutably.
pub struct WriteScope<'a> {
    // Field order matters: the guard is dropped before the revision bump.
    guard: RwLockWriteGuard<'a, ObjectModel>,
    bump: RevisionBump<'a>,
}

struct RevisionBump<'a> {
    revision: &'a watch::Sender<u64>,
    dirty: bool,
}

impl Drop for RevisionBump<'_> {
    fn drop(&mut self) {
        if self.dirty {
            self.revision.send_modify(|r| *r = r.wrapping_add(1));
        }
    }
}

impl Deref for WriteScope<'_> {
    type Target = ObjectModel;

    fn deref(&self) -> &ObjectModel {
        &self.guard
    }
}

impl DerefMut for WriteScope<'_> {
    fn deref_mut(&mut self) -> &mut ObjectModel {
        self.bump.dirty = true;
        &mut self.guard
    }
}
