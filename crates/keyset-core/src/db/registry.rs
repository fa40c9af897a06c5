//! Module: db::registry
//! Responsibility: process-wide binding of models to sessions, so callers
//! can reach a model's manager without threading a session through.
//! Boundary: explicit init and teardown only; nothing registers itself.

use crate::{
    db::{Manager, Session},
    error::ErrorClass,
    model::entity::EntityModel,
    traits::EntityKind,
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::LazyLock};
use thiserror::Error as ThisError;
use tracing::debug;

static REGISTRY: LazyLock<RwLock<HashMap<&'static str, Session>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

///
/// RegistryError
///

#[derive(Debug, ThisError)]
pub enum RegistryError {
    #[error("model '{0}' is not registered")]
    NotRegistered(&'static str),

    #[error("model '{0}' is already registered")]
    AlreadyRegistered(&'static str),
}

impl RegistryError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NotRegistered(_) => ErrorClass::NotFound,
            Self::AlreadyRegistered(_) => ErrorClass::InvariantViolation,
        }
    }
}

/// Bind `E` to `session`. A model can be bound once until it is
/// unregistered.
pub fn register<E: EntityKind>(session: Session) -> Result<(), RegistryError> {
    let mut registry = REGISTRY.write();
    if registry.contains_key(E::MODEL.path) {
        return Err(RegistryError::AlreadyRegistered(E::MODEL.path));
    }
    registry.insert(E::MODEL.path, session);
    debug!(entity = E::MODEL.name, "model registered");

    Ok(())
}

pub fn unregister<E: EntityKind>() -> bool {
    REGISTRY.write().remove(E::MODEL.path).is_some()
}

/// Drop every binding. Returns how many there were.
pub fn unregister_all() -> usize {
    let mut registry = REGISTRY.write();
    let count = registry.len();
    registry.clear();

    count
}

#[must_use]
pub fn is_registered(model: &EntityModel) -> bool {
    REGISTRY.read().contains_key(model.path)
}

/// Paths of every registered model, sorted.
#[must_use]
pub fn registered_models() -> Vec<&'static str> {
    let mut paths: Vec<&'static str> = REGISTRY.read().keys().copied().collect();
    paths.sort_unstable();

    paths
}

pub fn session_for<E: EntityKind>() -> Result<Session, RegistryError> {
    REGISTRY
        .read()
        .get(E::MODEL.path)
        .cloned()
        .ok_or(RegistryError::NotRegistered(E::MODEL.path))
}

/// Manager for `E` on the session it was registered with.
pub fn objects<E: EntityKind>() -> Result<Manager<E>, RegistryError> {
    session_for::<E>().map(Manager::new)
}
