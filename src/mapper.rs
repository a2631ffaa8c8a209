//! Object graph mapper
//!
//! Walks a live object graph out from one or more roots, diffs what it finds
//! against the snapshot store, and registers create/update rows on a statement
//! compiler. Relationships known to the snapshot but no longer reachable
//! through a visited field are scheduled for deletion; everything the
//! traversal never reaches is left alone.

use log::debug;

use crate::compiler::{Compiler, NodeRow, RelRow, VersionGuard};
use crate::error::{Result, StitchError};
use crate::metadata::{IdentityKind, RefDef, TypeDef, TypeKind, TypeRegistry};
use crate::model::Entity;
use crate::snapshot::{MappedRelationship, SnapshotStore};
use crate::types::{Direction, EntityId, NodeRef, Properties};

/// Horizon value meaning "traverse without bound"
pub const UNBOUNDED: i32 = -1;

/// Diffs object graphs against a snapshot and feeds a statement compiler
pub struct EntityGraphMapper<'a> {
  registry: &'a TypeRegistry,
  snapshot: &'a SnapshotStore,
}

impl<'a> EntityGraphMapper<'a> {
  pub fn new(registry: &'a TypeRegistry, snapshot: &'a SnapshotStore) -> Self {
    Self { registry, snapshot }
  }

  /// Map a single root to the given horizon: -1 unbounded, 0 the root only,
  /// N up to N hops out from the root.
  pub fn map(&self, root: &Entity, horizon: i32) -> Result<Compiler> {
    self.map_all(std::slice::from_ref(root), horizon)
  }

  /// Map several roots into one batch. The visited set is shared, so an
  /// entity reachable from two roots is written once.
  pub fn map_all(&self, roots: &[Entity], horizon: i32) -> Result<Compiler> {
    let mut compiler = Compiler::new();
    for rel in self.snapshot.relationships() {
      compiler.context_mut().register_relationship(rel.clone());
    }
    for root in roots {
      let def = self.registry.get(&root.type_name())?;
      if def.is_relationship_entity() {
        // the edge cannot be written without reaching both of its nodes
        if horizon == 0 {
          return Err(StitchError::InvalidDepth(def.name.clone()));
        }
        if !compiler.context().visited_relationship_entity(root.key()) {
          self.map_relationship_entity(&mut compiler, root, def, horizon)?;
        }
      } else {
        self.map_entity(&mut compiler, root, horizon)?;
      }
    }
    self.delete_obsolete_relationships(&mut compiler);
    Ok(compiler)
  }

  // --------------------------------------------------------------------------
  // Nodes
  // --------------------------------------------------------------------------

  fn map_entity(&self, compiler: &mut Compiler, entity: &Entity, horizon: i32) -> Result<NodeRef> {
    let def = self.registry.get(&entity.type_name())?;
    if def.is_relationship_entity() {
      return Err(StitchError::AmbiguousMetadata {
        type_name: def.name.clone(),
        reason: "relationship entity used in a node position".to_string(),
      });
    }
    if let Some(reference) = compiler.context().visited(entity.key()) {
      return Ok(reference);
    }

    let reference = match entity.id() {
      Some(id) => NodeRef::Resolved(id),
      None => {
        let row = compiler.context_mut().next_row_ref();
        compiler.context_mut().register_new_object(row, entity);
        NodeRef::Pending(row)
      }
    };
    compiler.context_mut().visit(entity.key(), reference);

    let dirty = match entity.id() {
      Some(id) => self.snapshot.is_dirty(id, entity, def),
      None => true,
    };
    if dirty {
      debug!("mapping {:?}", entity);
      compiler.context_mut().register_touched(entity);
      self.register_node_row(compiler, entity, def, reference);
    } else {
      debug!("unchanged, skipping write: {:?}", entity);
    }

    if horizon != 0 {
      self.map_entity_references(compiler, entity, def, reference, horizon - 1)?;
    }
    Ok(reference)
  }

  fn register_node_row(
    &self,
    compiler: &mut Compiler,
    entity: &Entity,
    def: &TypeDef,
    reference: NodeRef,
  ) {
    let mut props = entity.persistable_props(def);
    match reference {
      NodeRef::Pending(_) => {
        // a new versioned node starts its counter in the same statement
        if let Some(key) = &def.version_prop {
          props.insert(key.clone(), entity.version_value(def).unwrap_or(0).into());
        }
        let primary_index = match &def.identity {
          IdentityKind::PrimaryIndex(key) => Some(key.clone()),
          IdentityKind::Internal => None,
        };
        compiler.create_node(NodeRow {
          reference,
          labels: def.labels.clone(),
          primary_index,
          props,
          version: None,
        });
      }
      NodeRef::Resolved(_) => {
        let version = def.version_prop.as_ref().map(|key| VersionGuard {
          prop: key.clone(),
          expected: entity.version_value(def).unwrap_or(0),
        });
        compiler.update_node(NodeRow {
          reference,
          labels: def.labels.clone(),
          primary_index: None,
          props,
          version,
        });
      }
    }
  }

  // --------------------------------------------------------------------------
  // References
  // --------------------------------------------------------------------------

  fn map_entity_references(
    &self,
    compiler: &mut Compiler,
    entity: &Entity,
    def: &TypeDef,
    src_ref: NodeRef,
    horizon: i32,
  ) -> Result<()> {
    for field in &def.references {
      debug!("mapping references: {}.{}", def.name, field.field);

      // Clearing only applies to persisted owners: a new node has nothing in
      // the store to reconcile against.
      if let Some(src_id) = entity.id() {
        let ctx = compiler.context_mut();
        let cleared = match field.direction {
          Direction::Outgoing => {
            ctx.deregister_outgoing(src_id, &field.rel_type, &field.target_type)
          }
          Direction::Incoming => ctx.deregister_incoming(
            src_id,
            &field.rel_type,
            &field.target_type,
            field.relationship_entity,
          ),
          Direction::Undirected => {
            let incoming = ctx.deregister_incoming(
              src_id,
              &field.rel_type,
              &field.target_type,
              field.relationship_entity,
            );
            let outgoing = ctx.deregister_outgoing(src_id, &field.rel_type, &field.target_type);
            incoming || outgoing
          }
        };
        if !cleared {
          debug!("already managed: {}", field.rel_type);
          continue;
        }
      }

      for target in entity.refs(&field.field) {
        let both_ways = self.both_way_mapping_required(entity, field, &target);
        self.link(compiler, entity, src_ref, field, &target, horizon, both_ways)?;
      }
    }
    Ok(())
  }

  /// Two edges are needed when both ends declare the relationship in the
  /// same direction (each sees itself at the same side) and each instance
  /// actually points back at the other. Undirected pairs map as one edge.
  fn both_way_mapping_required(&self, src: &Entity, field: &RefDef, target: &Entity) -> bool {
    if field.direction == Direction::Undirected {
      return false;
    }
    let Ok(target_def) = self.registry.get(&target.type_name()) else {
      return false;
    };
    target_def.references.iter().any(|back| {
      back.rel_type == field.rel_type
        && back.direction == field.direction
        && target.refs(&back.field).iter().any(|t| t.same_instance(src))
    })
  }

  #[allow(clippy::too_many_arguments)]
  fn link(
    &self,
    compiler: &mut Compiler,
    src: &Entity,
    src_ref: NodeRef,
    field: &RefDef,
    target: &Entity,
    horizon: i32,
    both_ways: bool,
  ) -> Result<()> {
    let target_def = self.registry.get(&target.type_name())?;
    if target_def.is_relationship_entity() {
      if !compiler.context().visited_relationship_entity(target.key()) {
        self.map_relationship_entity(compiler, target, target_def, horizon)?;
      }
    } else {
      let tgt_ref = self.map_entity(compiler, target, horizon)?;
      self.update_relationship(compiler, src, src_ref, field, target, tgt_ref, both_ways);
    }
    Ok(())
  }

  // --------------------------------------------------------------------------
  // Plain Relationships
  // --------------------------------------------------------------------------

  #[allow(clippy::too_many_arguments)]
  fn update_relationship(
    &self,
    compiler: &mut Compiler,
    src: &Entity,
    src_ref: NodeRef,
    field: &RefDef,
    target: &Entity,
    tgt_ref: NodeRef,
    both_ways: bool,
  ) {
    if let (Some(src_id), Some(tgt_id)) = (src.id(), target.id()) {
      let mapped =
        self.known_relationship(field, src_id, &src.type_name(), tgt_id, &target.type_name());
      if self.snapshot.contains_relationship(&mapped) {
        // the edge survived the clearing pass unchanged
        debug!("context-add: {:?}", mapped);
        compiler.context_mut().register_relationship(mapped);
        return;
      }
    }
    self.maybe_create_relationship(
      compiler,
      src_ref,
      &src.type_name(),
      tgt_ref,
      &target.type_name(),
      field,
      both_ways,
    );
  }

  /// The snapshot tuple this field would have produced when it was loaded.
  /// Undirected fields prefer whichever orientation the store already holds.
  fn known_relationship(
    &self,
    field: &RefDef,
    src_id: EntityId,
    src_type: &str,
    tgt_id: EntityId,
    tgt_type: &str,
  ) -> MappedRelationship {
    match field.direction {
      Direction::Outgoing => {
        MappedRelationship::new(src_id, &field.rel_type, tgt_id, None, src_type, tgt_type)
      }
      Direction::Incoming => {
        MappedRelationship::new(tgt_id, &field.rel_type, src_id, None, tgt_type, src_type)
      }
      Direction::Undirected => {
        let incoming =
          MappedRelationship::new(tgt_id, &field.rel_type, src_id, None, tgt_type, src_type);
        if self.snapshot.contains_relationship(&incoming) {
          incoming
        } else {
          MappedRelationship::new(src_id, &field.rel_type, tgt_id, None, src_type, tgt_type)
        }
      }
    }
  }

  #[allow(clippy::too_many_arguments)]
  fn maybe_create_relationship(
    &self,
    compiler: &mut Compiler,
    src_ref: NodeRef,
    src_type: &str,
    tgt_ref: NodeRef,
    tgt_type: &str,
    field: &RefDef,
    both_ways: bool,
  ) {
    let (start, start_type, end, end_type) = if field.direction == Direction::Incoming {
      (tgt_ref, tgt_type, src_ref, src_type)
    } else {
      (src_ref, src_type, tgt_ref, tgt_type)
    };
    if compiler
      .context()
      .has_directed_transient(&field.rel_type, start, end)
    {
      debug!("new relationship already registered: {}", field.rel_type);
      return;
    }
    if !both_ways
      && compiler
        .context()
        .has_transient_relationship(&field.rel_type, start, end)
    {
      // already mapped from the other end and only one edge is wanted
      debug!("relationship already mapped the other way: {}", field.rel_type);
      return;
    }
    self.really_create_relationship(compiler, &field.rel_type, start, start_type, end, end_type);
  }

  fn really_create_relationship(
    &self,
    compiler: &mut Compiler,
    rel_type: &str,
    start: NodeRef,
    start_type: &str,
    end: NodeRef,
    end_type: &str,
  ) {
    debug!("context-new: ({:?})-[:{}]->({:?})", start, rel_type, end);
    compiler
      .context_mut()
      .register_transient_relationship(rel_type, start, end);
    compiler.create_relationship(RelRow {
      rel_type: rel_type.to_string(),
      start,
      end,
      start_type: start_type.to_string(),
      end_type: end_type.to_string(),
      relationship_entity: false,
      rel_ref: None,
      rel_id: None,
      props: Properties::new(),
      version: None,
    });
  }

  // --------------------------------------------------------------------------
  // Relationship Entities
  // --------------------------------------------------------------------------

  fn map_relationship_entity(
    &self,
    compiler: &mut Compiler,
    entity: &Entity,
    def: &TypeDef,
    horizon: i32,
  ) -> Result<()> {
    let TypeKind::RelationshipEntity {
      rel_type,
      start_field,
      end_field,
    } = &def.kind
    else {
      return Err(StitchError::AmbiguousMetadata {
        type_name: def.name.clone(),
        reason: "expected a relationship entity".to_string(),
      });
    };
    compiler.context_mut().visit_relationship_entity(entity.key());

    let start = entity
      .single_ref(start_field)
      .ok_or_else(|| StitchError::MissingEndpoint {
        type_name: def.name.clone(),
        slot: "start",
      })?;
    let end = entity
      .single_ref(end_field)
      .ok_or_else(|| StitchError::MissingEndpoint {
        type_name: def.name.clone(),
        slot: "end",
      })?;

    // An edge re-pointed at different nodes since it was loaded cannot be
    // updated in place; it is written as a fresh edge and the old one falls
    // out of the register and gets deleted.
    if let Some(rel_id) = entity.id() {
      if self.relation_ends_changed(rel_id, &start, &end) {
        debug!("relationship entity {} has new ends, recreating", rel_id);
        entity.set_id(None);
      }
    }

    let start_ref = self.map_entity(compiler, &start, horizon)?;
    let end_ref = self.map_entity(compiler, &end, horizon)?;

    match entity.id() {
      Some(rel_id) => {
        if let (Some(start_id), Some(end_id)) = (start.id(), end.id()) {
          let mapped = MappedRelationship::new(
            start_id,
            rel_type,
            end_id,
            Some(rel_id),
            start.type_name(),
            &def.name,
          );
          compiler.context_mut().register_relationship(mapped);
        }
        if self.snapshot.is_relationship_entity_dirty(rel_id, entity, def) {
          compiler.context_mut().register_touched(entity);
          let version = def.version_prop.as_ref().map(|key| VersionGuard {
            prop: key.clone(),
            expected: entity.version_value(def).unwrap_or(0),
          });
          compiler.update_relationship_entity(RelRow {
            rel_type: rel_type.clone(),
            start: start_ref,
            end: end_ref,
            start_type: start.type_name(),
            end_type: def.name.clone(),
            relationship_entity: true,
            rel_ref: None,
            rel_id: Some(rel_id),
            props: entity.persistable_props(def),
            version,
          });
        }
      }
      None => {
        let row = compiler.context_mut().next_row_ref();
        compiler.context_mut().register_new_relationship_entity(row, entity);
        compiler.context_mut().register_touched(entity);
        let mut props = entity.persistable_props(def);
        if let Some(key) = &def.version_prop {
          props.insert(key.clone(), entity.version_value(def).unwrap_or(0).into());
        }
        debug!("context-new: ({:?})-[:{}]->({:?})", start_ref, rel_type, end_ref);
        compiler
          .context_mut()
          .register_transient_relationship(rel_type, start_ref, end_ref);
        compiler.create_relationship(RelRow {
          rel_type: rel_type.clone(),
          start: start_ref,
          end: end_ref,
          start_type: start.type_name(),
          end_type: def.name.clone(),
          relationship_entity: true,
          rel_ref: Some(row),
          rel_id: None,
          props,
          version: None,
        });
      }
    }
    Ok(())
  }

  fn relation_ends_changed(&self, rel_id: EntityId, start: &Entity, end: &Entity) -> bool {
    self.snapshot.relationships().any(|rel| {
      rel.rel_id == Some(rel_id)
        && (Some(rel.start) != start.id() || Some(rel.end) != end.id())
    })
  }

  // --------------------------------------------------------------------------
  // Deletions
  // --------------------------------------------------------------------------

  /// Everything the snapshot knew that the traversal cleared and never
  /// re-established is obsolete. Relationships owned by nodes the traversal
  /// never visited were never cleared and survive untouched.
  fn delete_obsolete_relationships(&self, compiler: &mut Compiler) {
    for rel in self.snapshot.relationships() {
      if !compiler.context_mut().remove_registered_relationship(rel) {
        debug!("context-del: ({})-[:{}]->({})", rel.start, rel.rel_type, rel.end);
        let version = rel
          .rel_id
          .and_then(|rel_id| self.relationship_entity_guard(rel, rel_id));
        compiler.unrelate(rel.clone(), version);
      }
    }
  }

  /// Delete guard for a relationship entity of a versioned type: the
  /// last-known counter from the snapshot, under the type's version property
  fn relationship_entity_guard(
    &self,
    rel: &MappedRelationship,
    rel_id: EntityId,
  ) -> Option<VersionGuard> {
    // the end-type slot of an entity tuple holds the entity's own type name
    let def = self.registry.get(&rel.end_type).ok()?;
    let prop = def.version_prop.clone()?;
    Some(VersionGuard {
      prop,
      expected: self.snapshot.relationship_entity_version(rel_id).unwrap_or(0),
    })
  }
}

// ============================================================================
// Tests
// ============================================================================
