//! Enrolled entities and their cancellation tokens.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use cartograph_shared::{Entity, EntityId};

struct Enrolled {
    entity: Entity,
    deleted: bool,
    cancel: CancellationToken,
}

#[derive(Default)]
pub struct EntityRegistry {
    entities: Mutex<BTreeMap<EntityId, Enrolled>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity. Returns `false` if it was already known, deleted
    /// or not; a deleted entity is not resurrected by a repeat feed entry.
    pub fn enroll(&self, entity: Entity) -> bool {
        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        if entities.contains_key(&entity.entity_id) {
            return false;
        }
        entities.insert(
            entity.entity_id.clone(),
            Enrolled {
                entity,
                deleted: false,
                cancel: CancellationToken::new(),
            },
        );
        true
    }

    pub fn get(&self, entity_id: &EntityId) -> Option<Entity> {
        let entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        entities
            .get(entity_id)
            .filter(|e| !e.deleted)
            .map(|e| e.entity.clone())
    }

    pub fn is_active(&self, entity_id: &EntityId) -> bool {
        self.get(entity_id).is_some()
    }

    /// Live entities in id order.
    pub fn active(&self) -> Vec<Entity> {
        let entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        entities
            .values()
            .filter(|e| !e.deleted)
            .map(|e| e.entity.clone())
            .collect()
    }

    /// Mark an entity deleted and fire its cancellation token. Returns
    /// `false` if it was unknown or already deleted.
    pub fn delete(&self, entity_id: &EntityId) -> bool {
        let mut entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        match entities.get_mut(entity_id) {
            Some(e) if !e.deleted => {
                e.deleted = true;
                e.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancellation token for a job against this entity. Unknown or deleted
    /// entities get an already-cancelled token.
    pub fn token(&self, entity_id: &EntityId) -> CancellationToken {
        let entities = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        match entities.get(entity_id) {
            Some(e) => e.cancel.child_token(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    pub fn len(&self) -> usize {
        self.active().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
