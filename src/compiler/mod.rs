//! Statement compiler
//!
//! Accumulates node and relationship rows registered by the mapper, grouped
//! by statement shape, and renders them into batched parameterized statements
//! in dependency order: create-nodes first (they return generated identities),
//! then create-relationships (which may reference those identities), then
//! updates, then deletions.

pub mod context;
pub mod cypher;

use indexmap::IndexMap;
use serde_json::json;

use crate::snapshot::MappedRelationship;
use crate::types::{EntityId, NodeRef, Properties, RowRef};

pub use context::CompileContext;
pub use cypher::Statement;

// ============================================================================
// Rows
// ============================================================================

/// Optimistic-lock guard attached to an update row
#[derive(Debug, Clone)]
pub(crate) struct VersionGuard {
  pub prop: String,
  pub expected: i64,
}

/// One node instance awaiting a create or update statement
#[derive(Debug, Clone)]
pub(crate) struct NodeRow {
  pub reference: NodeRef,
  pub labels: Vec<String>,
  pub primary_index: Option<String>,
  pub props: Properties,
  pub version: Option<VersionGuard>,
}

/// A previously-known relationship scheduled for deletion, with the
/// optimistic-lock guard of its relationship entity when one applies
#[derive(Debug, Clone)]
pub(crate) struct DeletedRelationship {
  pub tuple: MappedRelationship,
  pub version: Option<VersionGuard>,
}

/// One relationship instance awaiting a create or update statement.
///
/// Invariant: `start` and `end` are always present, each either a resolved
/// identity or a row reference pending in the same batch.
#[derive(Debug, Clone)]
pub(crate) struct RelRow {
  pub rel_type: String,
  pub start: NodeRef,
  pub end: NodeRef,
  pub start_type: String,
  pub end_type: String,
  pub relationship_entity: bool,
  /// Pending row reference of a new relationship entity
  pub rel_ref: Option<RowRef>,
  /// Edge identity of an existing relationship entity
  pub rel_id: Option<EntityId>,
  pub props: Properties,
  pub version: Option<VersionGuard>,
}

// ============================================================================
// Compiler
// ============================================================================

/// Accumulates rows for one mapping pass and renders them into statements
#[derive(Debug, Default)]
pub struct Compiler {
  context: CompileContext,
  new_nodes: Vec<NodeRow>,
  existing_nodes: Vec<NodeRow>,
  new_relationships: Vec<RelRow>,
  existing_relationships: Vec<RelRow>,
  deleted_relationships: Vec<DeletedRelationship>,
}

impl Compiler {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn context(&self) -> &CompileContext {
    &self.context
  }

  pub fn context_mut(&mut self) -> &mut CompileContext {
    &mut self.context
  }

  // --------------------------------------------------------------------------
  // Row Registration (mapper-facing)
  // --------------------------------------------------------------------------

  pub(crate) fn create_node(&mut self, row: NodeRow) {
    self.new_nodes.push(row);
  }

  pub(crate) fn update_node(&mut self, row: NodeRow) {
    self.existing_nodes.push(row);
  }

  pub(crate) fn create_relationship(&mut self, row: RelRow) {
    self.new_relationships.push(row);
  }

  pub(crate) fn update_relationship_entity(&mut self, row: RelRow) {
    self.existing_relationships.push(row);
  }

  pub(crate) fn new_relationship_rows(&self) -> &[RelRow] {
    &self.new_relationships
  }

  /// Schedule a previously-known relationship for deletion. If this pass also
  /// registered a new row re-establishing the same edge, the new row is
  /// cancelled instead and nothing is deleted. Relationship entities of a
  /// versioned type carry their last-known counter as a delete guard.
  pub(crate) fn unrelate(&mut self, relationship: MappedRelationship, version: Option<VersionGuard>) {
    if relationship.rel_id.is_none() {
      let cancelled = self.new_relationships.iter().position(|row| {
        row.rel_type == relationship.rel_type
          && self.context.node_id(row.start) == Some(relationship.start)
          && self.context.node_id(row.end) == Some(relationship.end)
      });
      if let Some(pos) = cancelled {
        self.new_relationships.remove(pos);
        return;
      }
    }
    self.deleted_relationships.push(DeletedRelationship {
      tuple: relationship,
      version,
    });
  }

  pub(crate) fn deleted_relationship_tuples(&self) -> impl Iterator<Item = &MappedRelationship> {
    self.deleted_relationships.iter().map(|deleted| &deleted.tuple)
  }

  // --------------------------------------------------------------------------
  // Statement Accessors
  // --------------------------------------------------------------------------

  /// True while any new relationship still references a node row whose
  /// generated identity has not been reported back yet. The executor must run
  /// the create-nodes statements and merge their results first.
  pub fn has_statements_dependent_on_new_nodes(&self) -> bool {
    self.new_relationships.iter().any(|row| {
      self.context.resolve(row.start).is_pending() || self.context.resolve(row.end).is_pending()
    })
  }

  /// One statement per distinct (label set, primary index) shape
  pub fn create_nodes_statements(&self) -> Vec<Statement> {
    let mut groups: IndexMap<(String, Option<String>), Vec<&NodeRow>> = IndexMap::new();
    for row in &self.new_nodes {
      let key = (row.labels.join(":"), row.primary_index.clone());
      groups.entry(key).or_default().push(row);
    }
    groups
      .into_iter()
      .map(|((_, primary_index), rows)| {
        let params = rows
          .iter()
          .map(|row| {
            let node_ref = match row.reference {
              NodeRef::Pending(row_ref) => row_ref.token(),
              // new nodes always carry a pending reference
              NodeRef::Resolved(id) => id.to_string(),
            };
            json!({ "nodeRef": node_ref, "props": row.props })
          })
          .collect();
        cypher::new_nodes(&rows[0].labels, primary_index.as_deref(), params)
      })
      .collect()
  }

  /// One statement per guard shape (unversioned, or per version property)
  pub fn update_nodes_statements(&self) -> Vec<Statement> {
    let mut groups: IndexMap<Option<String>, Vec<&NodeRow>> = IndexMap::new();
    for row in &self.existing_nodes {
      let key = row.version.as_ref().map(|guard| guard.prop.clone());
      groups.entry(key).or_default().push(row);
    }
    groups
      .into_iter()
      .map(|(version_prop, rows)| {
        let params = rows
          .iter()
          .map(|row| {
            let node_id = self.context.resolve(row.reference).to_param();
            match &row.version {
              Some(guard) => {
                json!({ "nodeId": node_id, "props": row.props, "version": guard.expected })
              }
              None => json!({ "nodeId": node_id, "props": row.props }),
            }
          })
          .collect();
        cypher::update_nodes(version_prop.as_deref(), params)
      })
      .collect()
  }

  /// One statement per (relationship type, plain-or-entity) shape
  pub fn create_relationships_statements(&self) -> Vec<Statement> {
    let mut groups: IndexMap<(String, bool), Vec<&RelRow>> = IndexMap::new();
    for row in &self.new_relationships {
      let key = (row.rel_type.clone(), row.relationship_entity);
      groups.entry(key).or_default().push(row);
    }
    groups
      .into_iter()
      .map(|((rel_type, relationship_entity), rows)| {
        let params = rows
          .iter()
          .map(|row| {
            let mut value = json!({
              "startNodeId": self.context.resolve(row.start).to_param(),
              "endNodeId": self.context.resolve(row.end).to_param(),
              "relRef": row.rel_ref.map(|r| r.token()),
            });
            if relationship_entity {
              value["props"] = json!(row.props);
            }
            value
          })
          .collect();
        cypher::new_relationships(&rel_type, relationship_entity, params)
      })
      .collect()
  }

  /// Updates of relationship entities whose own properties changed
  pub fn update_relationships_statements(&self) -> Vec<Statement> {
    let mut groups: IndexMap<Option<String>, Vec<&RelRow>> = IndexMap::new();
    for row in &self.existing_relationships {
      let key = row.version.as_ref().map(|guard| guard.prop.clone());
      groups.entry(key).or_default().push(row);
    }
    groups
      .into_iter()
      .map(|(version_prop, rows)| {
        let params = rows
          .iter()
          .map(|row| match &row.version {
            Some(guard) => {
              json!({ "relId": row.rel_id, "props": row.props, "version": guard.expected })
            }
            None => json!({ "relId": row.rel_id, "props": row.props }),
          })
          .collect();
        cypher::update_relationship_entities(version_prop.as_deref(), params)
      })
      .collect()
  }

  /// Deletions of plain relationships, grouped by type
  pub fn delete_relationships_statements(&self) -> Vec<Statement> {
    let mut groups: IndexMap<String, Vec<serde_json::Value>> = IndexMap::new();
    for deleted in &self.deleted_relationships {
      let rel = &deleted.tuple;
      if rel.rel_id.is_some() {
        continue;
      }
      groups
        .entry(rel.rel_type.clone())
        .or_default()
        .push(json!({ "startNodeId": rel.start, "endNodeId": rel.end }));
    }
    groups
      .into_iter()
      .map(|(rel_type, rows)| cypher::delete_relationships(&rel_type, rows))
      .collect()
  }

  /// Deletions of relationship entities, matched by edge identity and grouped
  /// by guard shape (unversioned, or per version property)
  pub fn delete_relationship_entity_statements(&self) -> Vec<Statement> {
    let mut groups: IndexMap<Option<String>, Vec<serde_json::Value>> = IndexMap::new();
    for deleted in &self.deleted_relationships {
      let Some(rel_id) = deleted.tuple.rel_id else {
        continue;
      };
      let key = deleted.version.as_ref().map(|guard| guard.prop.clone());
      let row = match &deleted.version {
        Some(guard) => json!({ "relId": rel_id, "version": guard.expected }),
        None => json!({ "relId": rel_id }),
      };
      groups.entry(key).or_default().push(row);
    }
    groups
      .into_iter()
      .map(|(version_prop, rows)| {
        cypher::delete_relationship_entities(version_prop.as_deref(), rows)
      })
      .collect()
  }

  /// Every statement of the pass, in dependency order
  pub fn all_statements(&self) -> Vec<Statement> {
    let mut statements = self.create_nodes_statements();
    statements.extend(self.create_relationships_statements());
    statements.extend(self.update_nodes_statements());
    statements.extend(self.update_relationships_statements());
    statements.extend(self.delete_relationships_statements());
    statements.extend(self.delete_relationship_entity_statements());
    statements
  }
}

// ============================================================================
// Tests
// ============================================================================
