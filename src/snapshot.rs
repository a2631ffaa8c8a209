//! Snapshot store
//!
//! Holds the last-known persisted state of every tracked entity and
//! relationship for the lifetime of a session. The mapper diffs a freshly
//! traversed object graph against this store; the session merges generated
//! identities back into it after a batch executes successfully.
//!
//! Single-writer per session: no internal locking, distinct sessions own
//! distinct stores.

use std::collections::{HashMap, HashSet};

use crate::metadata::TypeDef;
use crate::model::Entity;
use crate::types::{EntityId, Properties};

// ============================================================================
// Mapped Relationships
// ============================================================================

/// A relationship as currently believed to exist in the store.
///
/// Equality is structural on the whole tuple; a relationship present in the
/// snapshot but absent from a traversal is a deletion candidate, one present
/// in the traversal but absent from the snapshot is a creation candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappedRelationship {
  pub start: EntityId,
  pub rel_type: String,
  pub end: EntityId,
  /// Identity of the edge itself; tracked only for relationship entities
  pub rel_id: Option<EntityId>,
  pub start_type: String,
  pub end_type: String,
}

impl MappedRelationship {
  pub fn new(
    start: EntityId,
    rel_type: impl Into<String>,
    end: EntityId,
    rel_id: Option<EntityId>,
    start_type: impl Into<String>,
    end_type: impl Into<String>,
  ) -> Self {
    Self {
      start,
      rel_type: rel_type.into(),
      end,
      rel_id,
      start_type: start_type.into(),
      end_type: end_type.into(),
    }
  }

  pub fn involves(&self, identity: EntityId) -> bool {
    self.start == identity || self.end == identity
  }
}

// ============================================================================
// Snapshot Store
// ============================================================================

#[derive(Debug, Clone)]
struct NodeSnapshot {
  type_name: String,
  props: Properties,
  version: Option<i64>,
}

#[derive(Debug, Clone)]
struct RelEntitySnapshot {
  props: Properties,
  version: Option<i64>,
}

/// Last-known persisted state of entities and relationships in one session
#[derive(Debug, Default)]
pub struct SnapshotStore {
  nodes: HashMap<EntityId, NodeSnapshot>,
  relationships: HashSet<MappedRelationship>,
  rel_entities: HashMap<EntityId, RelEntitySnapshot>,
}

impl SnapshotStore {
  pub fn new() -> Self {
    Self::default()
  }

  // --------------------------------------------------------------------------
  // Nodes
  // --------------------------------------------------------------------------

  /// Register or update the last-known state of a node entity.
  /// Overwrites any prior record for the same identity.
  pub fn record_entity(&mut self, identity: EntityId, entity: &Entity, def: &TypeDef) {
    self.nodes.insert(
      identity,
      NodeSnapshot {
        type_name: def.name.clone(),
        props: entity.persistable_props(def),
        version: entity.version_value(def),
      },
    );
  }

  pub fn remove_entity(&mut self, identity: EntityId) {
    self.nodes.remove(&identity);
  }

  /// Identity under which the instance is persisted, or None if it is new
  pub fn native_identity(&self, entity: &Entity) -> Option<EntityId> {
    entity.id()
  }

  /// True when the instance's current state differs from the recorded one.
  /// Instances without a record (never persisted, or evicted) are dirty.
  pub fn is_dirty(&self, identity: EntityId, entity: &Entity, def: &TypeDef) -> bool {
    match self.nodes.get(&identity) {
      Some(snapshot) => {
        snapshot.type_name != def.name
          || snapshot.props != entity.persistable_props(def)
          || snapshot.version != entity.version_value(def)
      }
      None => true,
    }
  }

  pub fn tracks_entity(&self, identity: EntityId) -> bool {
    self.nodes.contains_key(&identity)
  }

  // --------------------------------------------------------------------------
  // Relationships
  // --------------------------------------------------------------------------

  pub fn record_relationship(&mut self, relationship: MappedRelationship) {
    self.relationships.insert(relationship);
  }

  pub fn remove_relationship(&mut self, relationship: &MappedRelationship) -> bool {
    self.relationships.remove(relationship)
  }

  pub fn contains_relationship(&self, relationship: &MappedRelationship) -> bool {
    self.relationships.contains(relationship)
  }

  pub fn relationships(&self) -> impl Iterator<Item = &MappedRelationship> {
    self.relationships.iter()
  }

  /// Previously-known relationships with the given node at either end
  pub fn relationships_involving(&self, identity: EntityId) -> Vec<&MappedRelationship> {
    self
      .relationships
      .iter()
      .filter(|rel| rel.involves(identity))
      .collect()
  }

  // --------------------------------------------------------------------------
  // Relationship Entities
  // --------------------------------------------------------------------------

  pub fn record_relationship_entity(&mut self, identity: EntityId, entity: &Entity, def: &TypeDef) {
    self.rel_entities.insert(
      identity,
      RelEntitySnapshot {
        props: entity.persistable_props(def),
        version: entity.version_value(def),
      },
    );
  }

  pub fn is_relationship_entity_dirty(
    &self,
    identity: EntityId,
    entity: &Entity,
    def: &TypeDef,
  ) -> bool {
    match self.rel_entities.get(&identity) {
      Some(snapshot) => {
        snapshot.props != entity.persistable_props(def)
          || snapshot.version != entity.version_value(def)
      }
      None => true,
    }
  }

  /// Last-known optimistic-lock counter of a tracked relationship entity
  pub fn relationship_entity_version(&self, identity: EntityId) -> Option<i64> {
    self.rel_entities.get(&identity).and_then(|snapshot| snapshot.version)
  }

  pub fn remove_relationship_entity(&mut self, identity: EntityId) {
    self.rel_entities.remove(&identity);
  }

  // --------------------------------------------------------------------------
  // Lifecycle
  // --------------------------------------------------------------------------

  /// Drop all tracked state. Idempotent.
  pub fn clear(&mut self) {
    self.nodes.clear();
    self.relationships.clear();
    self.rel_entities.clear();
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;
  use crate::metadata::TypeDef;

  fn teacher_def() -> TypeDef {
    TypeDef::node("Teacher").prop("name")
  }

  #[test]
  fn test_record_makes_entity_clean() {
    let def = teacher_def();
    let mary = Entity::with_id("Teacher", 3);
    mary.set_prop("name", "Mary");

    let mut store = SnapshotStore::new();
    assert!(store.is_dirty(3, &mary, &def));

    store.record_entity(3, &mary, &def);
    assert!(!store.is_dirty(3, &mary, &def));

    mary.set_prop("name", "Mary Ann");
    assert!(store.is_dirty(3, &mary, &def));
  }

  #[test]
  fn test_record_overwrites_prior_state() {
    let def = teacher_def();
    let mary = Entity::with_id("Teacher", 3);
    mary.set_prop("name", "Mary");

    let mut store = SnapshotStore::new();
    store.record_entity(3, &mary, &def);
    mary.set_prop("name", "Mary Ann");
    store.record_entity(3, &mary, &def);
    assert!(!store.is_dirty(3, &mary, &def));
  }

  #[test]
  fn test_relationship_set_is_structural() {
    let mut store = SnapshotStore::new();
    let rel = MappedRelationship::new(1, "SCHOOL", 2, None, "Teacher", "School");
    store.record_relationship(rel.clone());

    // A structurally equal tuple is the same relationship.
    let same = MappedRelationship::new(1, "SCHOOL", 2, None, "Teacher", "School");
    assert!(store.contains_relationship(&same));
    assert!(store.remove_relationship(&same));
    assert!(!store.remove_relationship(&rel));
  }

  #[test]
  fn test_relationships_involving() {
    let mut store = SnapshotStore::new();
    store.record_relationship(MappedRelationship::new(1, "SCHOOL", 2, None, "T", "S"));
    store.record_relationship(MappedRelationship::new(3, "SCHOOL", 1, None, "T", "S"));
    store.record_relationship(MappedRelationship::new(3, "SCHOOL", 4, None, "T", "S"));

    assert_eq!(store.relationships_involving(1).len(), 2);
    assert_eq!(store.relationships_involving(4).len(), 1);
    assert!(store.relationships_involving(9).is_empty());
  }

  #[test]
  fn test_clear_is_idempotent() {
    let def = teacher_def();
    let mary = Entity::with_id("Teacher", 3);
    let mut store = SnapshotStore::new();
    store.record_entity(3, &mary, &def);
    store.record_relationship(MappedRelationship::new(1, "R", 2, None, "A", "B"));

    store.clear();
    assert!(!store.tracks_entity(3));
    assert_eq!(store.relationships().count(), 0);
    store.clear();
  }
}
