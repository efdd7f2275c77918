//! Generational entity registry for the Stardust engine.
//!
//! Entities are the game objects the rest of the engine animates:
//! projectiles, lasers, enemies, bosses, the player, items. They are owned
//! by the registry and referenced everywhere else through [`EntityId`], a
//! generational handle that stays safe to hold after the entity dies --
//! resolving a stale handle simply fails instead of touching freed state.
//!
//! The engine core uses this to bind task lifetimes to entity lifetimes:
//! the scheduler checks [`EntityRegistry::is_live`] before every resume of
//! a bound task.
//!
//! The registry is single-threaded like the rest of the engine core. A
//! thread-local default instance is available through [`with`], which is
//! what the scheduler and gameplay code share.

use std::cell::RefCell;
use std::fmt;
use std::num::NonZeroU32;

// ---------------------------------------------------------------------------
// EntityKind
// ---------------------------------------------------------------------------

/// The taxonomy of game objects that can be registered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Projectile,
    Laser,
    Enemy,
    Boss,
    Player,
    Item,
}

impl EntityKind {
    /// Human-readable name, for logs and debug overlays.
    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Projectile => "projectile",
            EntityKind::Laser => "laser",
            EntityKind::Enemy => "enemy",
            EntityKind::Boss => "boss",
            EntityKind::Player => "player",
            EntityKind::Item => "item",
        }
    }
}

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Generational handle to a registered entity.
///
/// Layout is `{ slot index, generation }`. The generation is bumped every
/// time a slot is vacated, so a handle to a despawned entity can never
/// resolve to whatever reuses its slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId {
    index: u32,
    generation: NonZeroU32,
}

impl EntityId {
    /// The slot index within the registry.
    #[inline]
    pub fn index(self) -> u32 {
        self.index
    }

    /// The generation this handle was issued for.
    #[inline]
    pub fn generation(self) -> u32 {
        self.generation.get()
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// EntityRegistry
// ---------------------------------------------------------------------------

struct EntitySlot {
    /// Incremented every time the slot is vacated. Never zero.
    generation: u32,
    /// `Some` while an entity occupies the slot.
    kind: Option<EntityKind>,
}

/// Slab of entity slots with generation-checked lookup.
#[derive(Default)]
pub struct EntityRegistry {
    slots: Vec<EntitySlot>,
    free: Vec<u32>,
    live: usize,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new entity and return its handle.
    pub fn spawn(&mut self, kind: EntityKind) -> EntityId {
        let index = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.kind = Some(kind);
                index
            }
            None => {
                self.slots.push(EntitySlot {
                    generation: 1,
                    kind: Some(kind),
                });
                (self.slots.len() - 1) as u32
            }
        };

        self.live += 1;
        let generation = self.slots[index as usize].generation;
        EntityId {
            index,
            generation: NonZeroU32::new(generation).expect("entity generation wrapped to zero"),
        }
    }

    /// Remove an entity, invalidating every outstanding handle to it.
    ///
    /// Returns `false` if the handle was already stale (idempotent).
    pub fn despawn(&mut self, id: EntityId) -> bool {
        let Some(slot) = self.slots.get_mut(id.index as usize) else {
            return false;
        };
        if slot.kind.is_none() || slot.generation != id.generation.get() {
            return false;
        }

        slot.kind = None;
        // Skip generation zero so freshly issued handles stay NonZero.
        slot.generation = slot.generation.checked_add(1).unwrap_or(1);
        self.free.push(id.index);
        self.live -= 1;
        true
    }

    /// Whether the handle still refers to a live entity.
    pub fn is_live(&self, id: EntityId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.kind.is_some() && slot.generation == id.generation.get())
    }

    /// The kind of the referenced entity, if it is still live.
    pub fn kind_of(&self, id: EntityId) -> Option<EntityKind> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation == id.generation.get() {
            slot.kind
        } else {
            None
        }
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

// ---------------------------------------------------------------------------
// Thread-local default registry
// ---------------------------------------------------------------------------

thread_local! {
    static REGISTRY: RefCell<EntityRegistry> = RefCell::new(EntityRegistry::new());
}

/// Run `f` against this thread's registry.
///
/// This is the instance the scheduler consults for bound-entity liveness;
/// gameplay code should register entities through it too. Do not call back
/// into `with` from inside `f`.
pub fn with<R>(f: impl FnOnce(&mut EntityRegistry) -> R) -> R {
    REGISTRY.with(|registry| f(&mut registry.borrow_mut()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_resolve() {
        let mut reg = EntityRegistry::new();
        let id = reg.spawn(EntityKind::Enemy);
        assert!(reg.is_live(id));
        assert_eq!(reg.kind_of(id), Some(EntityKind::Enemy));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_despawn_invalidates_handle() {
        let mut reg = EntityRegistry::new();
        let id = reg.spawn(EntityKind::Projectile);
        assert!(reg.despawn(id));
        assert!(!reg.is_live(id));
        assert_eq!(reg.kind_of(id), None);
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_despawn_is_idempotent() {
        let mut reg = EntityRegistry::new();
        let id = reg.spawn(EntityKind::Item);
        assert!(reg.despawn(id));
        assert!(!reg.despawn(id), "second despawn must be a no-op");
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mut reg = EntityRegistry::new();
        let old = reg.spawn(EntityKind::Boss);
        reg.despawn(old);
        let new = reg.spawn(EntityKind::Player);

        assert_eq!(old.index(), new.index(), "slot should be reused");
        assert_ne!(old.generation(), new.generation());
        assert!(!reg.is_live(old), "stale handle must not resolve");
        assert!(reg.is_live(new));
    }

    #[test]
    fn test_thread_local_registry() {
        let id = with(|reg| reg.spawn(EntityKind::Laser));
        assert!(with(|reg| reg.is_live(id)));
        with(|reg| reg.despawn(id));
        assert!(!with(|reg| reg.is_live(id)));
    }
}
