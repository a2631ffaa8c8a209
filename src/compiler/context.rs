//! Compile context
//!
//! Per-traversal transient state: the visited set, the object-to-row-reference
//! table, the register of relationships carried over from the snapshot (pruned
//! as the traversal re-discovers them), and the deletions derived from what
//! was cleared but never re-established.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::model::{Entity, ObjKey};
use crate::snapshot::MappedRelationship;
use crate::types::{EntityId, NodeRef, RowRef};

/// Transient bookkeeping for one mapping pass
#[derive(Debug, Default)]
pub struct CompileContext {
  visited: HashMap<ObjKey, NodeRef>,
  visited_rel_entities: HashSet<ObjKey>,

  /// Unpersisted objects awaiting a generated identity, by row reference
  new_objects: HashMap<RowRef, Entity>,
  new_rel_entities: HashMap<RowRef, Entity>,

  /// Entities whose state will be written by this pass; the session
  /// re-snapshots them after the batch executes
  touched: Vec<Entity>,
  touched_keys: HashSet<ObjKey>,

  /// Relationships believed to exist in the store, seeded from the snapshot.
  /// Entries still present after traversal were re-discovered unchanged.
  registered: HashSet<MappedRelationship>,
  /// Relationships cleared by the traversal so far; entries may be restored
  /// when another field re-establishes them in the same pass
  cleared: Vec<MappedRelationship>,

  /// New edges discovered this pass, directed; guards against re-creating the
  /// same edge when it is reached from both ends
  transient_rels: HashSet<(String, NodeRef, NodeRef)>,

  /// Generated identities reported by the sink, merged in before dependent
  /// statements are rendered
  new_node_ids: HashMap<RowRef, EntityId>,
  new_rel_ids: HashMap<RowRef, EntityId>,

  next_row: u32,
}

impl CompileContext {
  pub fn new() -> Self {
    Self::default()
  }

  // --------------------------------------------------------------------------
  // Row References
  // --------------------------------------------------------------------------

  /// Assign the next symbolic row reference
  pub fn next_row_ref(&mut self) -> RowRef {
    let row = RowRef(self.next_row);
    self.next_row += 1;
    row
  }

  // --------------------------------------------------------------------------
  // Visited Set
  // --------------------------------------------------------------------------

  pub fn visit(&mut self, key: ObjKey, reference: NodeRef) {
    self.visited.insert(key, reference);
  }

  /// Row or identity reference assigned when the object was first visited
  pub fn visited(&self, key: ObjKey) -> Option<NodeRef> {
    self.visited.get(&key).copied()
  }

  pub fn visit_relationship_entity(&mut self, key: ObjKey) {
    self.visited_rel_entities.insert(key);
  }

  pub fn visited_relationship_entity(&self, key: ObjKey) -> bool {
    self.visited_rel_entities.contains(&key)
  }

  // --------------------------------------------------------------------------
  // New Objects
  // --------------------------------------------------------------------------

  pub fn register_new_object(&mut self, row: RowRef, entity: &Entity) {
    self.new_objects.insert(row, entity.clone());
  }

  pub fn register_new_relationship_entity(&mut self, row: RowRef, entity: &Entity) {
    self.new_rel_entities.insert(row, entity.clone());
  }

  pub fn new_objects(&self) -> impl Iterator<Item = (RowRef, &Entity)> {
    self.new_objects.iter().map(|(row, entity)| (*row, entity))
  }

  pub fn new_relationship_entities(&self) -> impl Iterator<Item = (RowRef, &Entity)> {
    self.new_rel_entities.iter().map(|(row, entity)| (*row, entity))
  }

  /// Log an entity whose state this pass will persist (create or update)
  pub fn register_touched(&mut self, entity: &Entity) {
    if self.touched_keys.insert(entity.key()) {
      self.touched.push(entity.clone());
    }
  }

  pub fn touched(&self) -> &[Entity] {
    &self.touched
  }

  // --------------------------------------------------------------------------
  // Relationship Register
  // --------------------------------------------------------------------------

  /// Seed or re-establish a relationship known to exist in the store
  pub fn register_relationship(&mut self, relationship: MappedRelationship) {
    self.registered.insert(relationship);
  }

  pub fn remove_registered_relationship(&mut self, relationship: &MappedRelationship) -> bool {
    self.registered.remove(relationship)
  }

  pub fn is_registered(&self, relationship: &MappedRelationship) -> bool {
    self.registered.contains(relationship)
  }

  /// Clear previously-known relationships matching an outgoing field on `src`:
  /// `(src)-[:TYPE]->(:EndType)`. Returns false when everything matching was
  /// already cleared earlier in this pass, which signals the caller that the
  /// field is already being managed.
  pub fn deregister_outgoing(&mut self, src: EntityId, rel_type: &str, end_type: &str) -> bool {
    debug!("context-del: ({})-[:{}]->()", src, rel_type);
    let cleared: Vec<MappedRelationship> = self
      .registered
      .iter()
      .filter(|rel| rel.start == src && rel.rel_type == rel_type && rel.end_type == end_type)
      .cloned()
      .collect();
    self.handle_cleared(cleared)
  }

  /// Clear previously-known relationships matching an incoming field on `tgt`:
  /// `(tgt)<-[:TYPE]-(:OtherType)`. For relationship-entity fields the field's
  /// target type is recorded at the end-type position of the tuple.
  pub fn deregister_incoming(
    &mut self,
    tgt: EntityId,
    rel_type: &str,
    other_type: &str,
    relationship_entity: bool,
  ) -> bool {
    debug!("context-del: ({})<-[:{}]-()", tgt, rel_type);
    let cleared: Vec<MappedRelationship> = self
      .registered
      .iter()
      .filter(|rel| {
        rel.end == tgt
          && rel.rel_type == rel_type
          && other_type
            == if relationship_entity {
              rel.end_type.as_str()
            } else {
              rel.start_type.as_str()
            }
      })
      .cloned()
      .collect();
    self.handle_cleared(cleared)
  }

  /// Process a batch of cleared relationships. A relationship that was already
  /// cleared earlier in the pass is restored instead of being deleted twice;
  /// everything else becomes a deletion candidate.
  fn handle_cleared(&mut self, cleared: Vec<MappedRelationship>) -> bool {
    if cleared.is_empty() {
      // nothing in the store matched, so there is nothing to manage
      return true;
    }
    let mut any = false;
    for rel in cleared {
      self.registered.remove(&rel);
      if self.already_cleared(&rel) {
        self.registered.insert(rel);
      } else {
        self.cleared.push(rel);
        any = true;
      }
    }
    any
  }

  fn already_cleared(&self, relationship: &MappedRelationship) -> bool {
    self.cleared.iter().any(|cleared| {
      cleared.start == relationship.start
        && cleared.end == relationship.end
        && cleared.rel_type == relationship.rel_type
    })
  }

  pub fn cleared_relationships(&self) -> &[MappedRelationship] {
    &self.cleared
  }

  // --------------------------------------------------------------------------
  // Transient Relationships
  // --------------------------------------------------------------------------

  /// True if the edge was already discovered this pass, from either end
  pub fn has_transient_relationship(&self, rel_type: &str, a: NodeRef, b: NodeRef) -> bool {
    self.transient_rels.contains(&(rel_type.to_string(), a, b))
      || self.transient_rels.contains(&(rel_type.to_string(), b, a))
  }

  /// True if the edge was already discovered in exactly this direction
  pub fn has_directed_transient(&self, rel_type: &str, start: NodeRef, end: NodeRef) -> bool {
    self.transient_rels.contains(&(rel_type.to_string(), start, end))
  }

  pub fn register_transient_relationship(&mut self, rel_type: &str, start: NodeRef, end: NodeRef) {
    self.transient_rels.insert((rel_type.to_string(), start, end));
  }

  // --------------------------------------------------------------------------
  // Generated Identities
  // --------------------------------------------------------------------------

  pub fn register_new_node_id(&mut self, row: RowRef, id: EntityId) {
    self.new_node_ids.insert(row, id);
  }

  pub fn register_new_relationship_id(&mut self, row: RowRef, id: EntityId) {
    self.new_rel_ids.insert(row, id);
  }

  /// Substitute a pending reference with its generated identity, if known
  pub fn resolve(&self, reference: NodeRef) -> NodeRef {
    match reference {
      NodeRef::Pending(row) => match self.new_node_ids.get(&row) {
        Some(id) => NodeRef::Resolved(*id),
        None => reference,
      },
      resolved => resolved,
    }
  }

  pub fn node_id(&self, reference: NodeRef) -> Option<EntityId> {
    match self.resolve(reference) {
      NodeRef::Resolved(id) => Some(id),
      NodeRef::Pending(_) => None,
    }
  }

  pub fn relationship_id(&self, row: RowRef) -> Option<EntityId> {
    self.new_rel_ids.get(&row).copied()
  }
}

// ============================================================================
// Tests
// ============================================================================
