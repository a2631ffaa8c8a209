//! Session
//!
//! A session owns one snapshot store and drives save passes end to end:
//! map the object graph, execute the compiled statements through a sink,
//! then merge generated identities and the new last-known state back into
//! the snapshot. The snapshot is only touched after every statement of the
//! pass has executed, so a failed pass leaves the session able to retry.
//!
//! One session per unit of work; sessions are not shared across threads.

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;

use crate::compiler::{Compiler, Statement};
use crate::error::{Result, StitchError};
use crate::mapper::{EntityGraphMapper, UNBOUNDED};
use crate::metadata::TypeRegistry;
use crate::model::{Entity, ObjKey};
use crate::snapshot::{MappedRelationship, SnapshotStore};
use crate::types::{EntityId, NodeRef, RowRef};

// ============================================================================
// Statement Sink
// ============================================================================

/// Outcome of executing one statement
#[derive(Debug, Default)]
pub struct StatementResult {
  /// Generated identities keyed by the row token submitted with the statement
  /// (`"_0"`, `"_1"`, ...)
  pub generated_ids: Vec<(String, EntityId)>,
  /// Number of rows the statement actually matched and wrote
  pub rows_affected: usize,
}

/// Executes compiled statements against a backing store.
///
/// Create statements return generated identities keyed by row token; update
/// statements report how many rows they matched, which the session compares
/// against the submitted row count when the statement carries a version guard.
pub trait StatementSink {
  fn execute(&mut self, statement: &Statement) -> Result<StatementResult>;
}

// ============================================================================
// Session
// ============================================================================

/// Tracks loaded state and saves object graphs through a statement sink
pub struct Session {
  registry: Arc<TypeRegistry>,
  snapshot: SnapshotStore,
}

impl Session {
  pub fn new(registry: Arc<TypeRegistry>) -> Self {
    Self {
      registry,
      snapshot: SnapshotStore::new(),
    }
  }

  pub fn registry(&self) -> &TypeRegistry {
    &self.registry
  }

  pub fn snapshot(&self) -> &SnapshotStore {
    &self.snapshot
  }

  /// Forget everything the session believes about the store. Idempotent.
  pub fn clear(&mut self) {
    self.snapshot.clear();
  }

  // --------------------------------------------------------------------------
  // Tracking
  // --------------------------------------------------------------------------

  /// Record an entity's current state as its last-known persisted state,
  /// as when it has just been loaded. Entities without an identity are
  /// ignored; they are new and will be picked up by the next save.
  pub fn track(&mut self, entity: &Entity) -> Result<()> {
    let def = self.registry.get(&entity.type_name())?;
    let Some(id) = entity.id() else {
      debug!("not tracking unpersisted entity {:?}", entity);
      return Ok(());
    };
    if def.is_relationship_entity() {
      self.snapshot.record_relationship_entity(id, entity, def);
    } else {
      self.snapshot.record_entity(id, entity, def);
    }
    Ok(())
  }

  /// Record a relationship known to exist in the store, as loaded
  pub fn track_relationship(&mut self, relationship: MappedRelationship) {
    self.snapshot.record_relationship(relationship);
  }

  // --------------------------------------------------------------------------
  // Saving
  // --------------------------------------------------------------------------

  /// Save the graph reachable from `root`, unbounded
  pub fn save(&mut self, sink: &mut dyn StatementSink, root: &Entity) -> Result<()> {
    self.save_with_depth(sink, root, UNBOUNDED)
  }

  /// Save the graph reachable from `root` up to `depth` hops out
  pub fn save_with_depth(
    &mut self,
    sink: &mut dyn StatementSink,
    root: &Entity,
    depth: i32,
  ) -> Result<()> {
    self.save_all(sink, std::slice::from_ref(root), depth)
  }

  /// Save several roots as one batch sharing a visited set
  pub fn save_all(
    &mut self,
    sink: &mut dyn StatementSink,
    roots: &[Entity],
    depth: i32,
  ) -> Result<()> {
    let mut compiler =
      EntityGraphMapper::new(&self.registry, &self.snapshot).map_all(roots, depth)?;

    let node_rows: HashSet<RowRef> =
      compiler.context().new_objects().map(|(row, _)| row).collect();
    let rel_rows: HashSet<RowRef> = compiler
      .context()
      .new_relationship_entities()
      .map(|(row, _)| row)
      .collect();

    // Creates run first: relationship and update statements may reference
    // identities generated here.
    for statement in compiler.create_nodes_statements() {
      let result = sink.execute(&statement)?;
      for (token, id) in result.generated_ids {
        let row = parse_row_token(&token, &node_rows)?;
        compiler.context_mut().register_new_node_id(row, id);
      }
    }

    for statement in compiler.create_relationships_statements() {
      let result = sink.execute(&statement)?;
      for (token, id) in result.generated_ids {
        let row = parse_row_token(&token, &rel_rows)?;
        compiler.context_mut().register_new_relationship_id(row, id);
      }
    }

    let updates = compiler
      .update_nodes_statements()
      .into_iter()
      .chain(compiler.update_relationships_statements());
    for statement in updates {
      let result = sink.execute(&statement)?;
      if statement.guarded && result.rows_affected < statement.row_count() {
        return Err(StitchError::StaleState {
          expected: statement.row_count(),
          affected: result.rows_affected,
        });
      }
    }

    let deletes = compiler
      .delete_relationships_statements()
      .into_iter()
      .chain(compiler.delete_relationship_entity_statements());
    for statement in deletes {
      let result = sink.execute(&statement)?;
      if statement.guarded && result.rows_affected < statement.row_count() {
        return Err(StitchError::StaleState {
          expected: statement.row_count(),
          affected: result.rows_affected,
        });
      }
    }

    self.apply(compiler)
  }

  /// Merge the outcome of a fully executed pass into the live entities and
  /// the snapshot. Not reached when any statement failed.
  fn apply(&mut self, compiler: Compiler) -> Result<()> {
    let context = compiler.context();
    let mut created: HashSet<ObjKey> = HashSet::new();

    for (row, entity) in context.new_objects() {
      let id = context
        .node_id(NodeRef::Pending(row))
        .ok_or_else(|| no_identity_reported(row))?;
      entity.set_id(Some(id));
      created.insert(entity.key());
    }
    for (row, entity) in context.new_relationship_entities() {
      let id = context
        .relationship_id(row)
        .ok_or_else(|| no_identity_reported(row))?;
      entity.set_id(Some(id));
      created.insert(entity.key());
    }

    for entity in context.touched() {
      let def = self.registry.get(&entity.type_name())?;
      // the store bumped the counter for guarded updates; mirror it
      if let Some(key) = &def.version_prop {
        let current = entity.version_value(def).unwrap_or(0);
        let next = if created.contains(&entity.key()) {
          current
        } else {
          current + 1
        };
        entity.set_prop(key.clone(), next);
      }
      let Some(id) = entity.id() else { continue };
      if def.is_relationship_entity() {
        self.snapshot.record_relationship_entity(id, entity, def);
      } else {
        self.snapshot.record_entity(id, entity, def);
      }
    }

    for row in compiler.new_relationship_rows() {
      let (Some(start), Some(end)) = (context.node_id(row.start), context.node_id(row.end)) else {
        return Err(StitchError::Backend(
          "a relationship row was left unresolved after execution".to_string(),
        ));
      };
      let rel_id = row
        .rel_id
        .or_else(|| row.rel_ref.and_then(|r| context.relationship_id(r)));
      self.snapshot.record_relationship(MappedRelationship::new(
        start,
        &row.rel_type,
        end,
        rel_id,
        &row.start_type,
        &row.end_type,
      ));
    }

    for rel in compiler.deleted_relationship_tuples() {
      self.snapshot.remove_relationship(rel);
      if let Some(rel_id) = rel.rel_id {
        self.snapshot.remove_relationship_entity(rel_id);
      }
    }
    Ok(())
  }
}

fn parse_row_token(token: &str, issued: &HashSet<RowRef>) -> Result<RowRef> {
  let row: RowRef = token
    .parse()
    .map_err(|_| StitchError::BadRowReference(token.to_string()))?;
  if !issued.contains(&row) {
    return Err(StitchError::BadRowReference(token.to_string()));
  }
  Ok(row)
}

fn no_identity_reported(row: RowRef) -> StitchError {
  StitchError::Backend(format!(
    "sink reported no identity for created row {}",
    row.token()
  ))
}

// ============================================================================
// Tests
// ============================================================================
