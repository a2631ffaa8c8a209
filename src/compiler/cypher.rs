//! Statement rendering
//!
//! Every statement is an `UNWIND $rows AS row` batch: one statement per
//! distinct shape, however many rows share that shape. Values travel only in
//! the parameter map; labels, relationship type names and property keys are
//! structural and are backtick-escaped before interpolation.

use serde::Serialize;

/// A parameterized statement ready for execution by a statement sink
#[derive(Debug, Clone, Serialize)]
pub struct Statement {
  pub text: String,
  pub parameters: serde_json::Map<String, serde_json::Value>,
  /// True when the statement carries an optimistic-lock guard; the executor
  /// must compare affected rows against `row_count`
  #[serde(skip)]
  pub guarded: bool,
}

impl Statement {
  fn new(text: String, rows: Vec<serde_json::Value>, guarded: bool) -> Self {
    let mut parameters = serde_json::Map::new();
    parameters.insert("rows".to_string(), serde_json::Value::Array(rows));
    Self {
      text,
      parameters,
      guarded,
    }
  }

  /// Number of rows submitted with this statement
  pub fn row_count(&self) -> usize {
    match self.parameters.get("rows") {
      Some(serde_json::Value::Array(rows)) => rows.len(),
      _ => 0,
    }
  }
}

/// Escape a structural identifier (label, type name, property key) for
/// interpolation. Identifiers come from metadata, not user data, but are
/// quoted anyway: backticks are doubled and the whole name wrapped.
pub fn escape(identifier: &str) -> String {
  format!("`{}`", identifier.replace('`', "``"))
}

// ============================================================================
// Node Statements
// ============================================================================

/// CREATE (or MERGE-by-primary-index) one batch of same-labeled new nodes
pub fn new_nodes(
  labels: &[String],
  primary_index: Option<&str>,
  rows: Vec<serde_json::Value>,
) -> Statement {
  let label_part: String = labels.iter().map(|label| format!(":{}", escape(label))).collect();
  let text = match primary_index {
    Some(key) => format!(
      "UNWIND $rows AS row MERGE (n{}{{{}: row.props.{}}}) SET n = row.props \
       RETURN row.nodeRef AS ref, ID(n) AS id",
      label_part,
      escape(key),
      escape(key)
    ),
    None => format!(
      "UNWIND $rows AS row CREATE (n{}) SET n = row.props \
       RETURN row.nodeRef AS ref, ID(n) AS id",
      label_part
    ),
  };
  Statement::new(text, rows, false)
}

/// Update one batch of existing nodes, optionally guarded by a version check
pub fn update_nodes(version_prop: Option<&str>, rows: Vec<serde_json::Value>) -> Statement {
  let text = match version_prop {
    Some(key) => {
      let key = escape(key);
      format!(
        "UNWIND $rows AS row MATCH (n) WHERE ID(n) = row.nodeId AND n.{key} = row.version \
         SET n += row.props, n.{key} = row.version + 1 \
         RETURN row.nodeId AS ref, ID(n) AS id"
      )
    }
    None => "UNWIND $rows AS row MATCH (n) WHERE ID(n) = row.nodeId SET n += row.props \
             RETURN row.nodeId AS ref, ID(n) AS id"
      .to_string(),
  };
  Statement::new(text, rows, version_prop.is_some())
}

// ============================================================================
// Relationship Statements
// ============================================================================

/// Create one batch of same-typed relationships.
///
/// Plain object references MERGE so an idempotent save cannot duplicate the
/// edge; relationship entities CREATE so parallel edges of the same type can
/// coexist, and carry their own property map.
pub fn new_relationships(
  rel_type: &str,
  relationship_entity: bool,
  rows: Vec<serde_json::Value>,
) -> Statement {
  let rel = escape(rel_type);
  let text = if relationship_entity {
    format!(
      "UNWIND $rows AS row \
       MATCH (startNode) WHERE ID(startNode) = row.startNodeId \
       MATCH (endNode) WHERE ID(endNode) = row.endNodeId \
       CREATE (startNode)-[rel:{rel}]->(endNode) SET rel += row.props \
       RETURN row.relRef AS ref, ID(rel) AS id"
    )
  } else {
    format!(
      "UNWIND $rows AS row \
       MATCH (startNode) WHERE ID(startNode) = row.startNodeId \
       MATCH (endNode) WHERE ID(endNode) = row.endNodeId \
       MERGE (startNode)-[rel:{rel}]->(endNode) \
       RETURN row.relRef AS ref, ID(rel) AS id"
    )
  };
  Statement::new(text, rows, false)
}

/// Update one batch of existing relationship entities by edge identity
pub fn update_relationship_entities(
  version_prop: Option<&str>,
  rows: Vec<serde_json::Value>,
) -> Statement {
  let text = match version_prop {
    Some(key) => {
      let key = escape(key);
      format!(
        "UNWIND $rows AS row MATCH ()-[rel]->() WHERE ID(rel) = row.relId AND rel.{key} = row.version \
         SET rel += row.props, rel.{key} = row.version + 1 \
         RETURN row.relId AS ref, ID(rel) AS id"
      )
    }
    None => "UNWIND $rows AS row MATCH ()-[rel]->() WHERE ID(rel) = row.relId SET rel += row.props \
             RETURN row.relId AS ref, ID(rel) AS id"
      .to_string(),
  };
  Statement::new(text, rows, version_prop.is_some())
}

/// Delete one batch of same-typed plain relationships, matched by endpoints
pub fn delete_relationships(rel_type: &str, rows: Vec<serde_json::Value>) -> Statement {
  let text = format!(
    "UNWIND $rows AS row \
     MATCH (startNode) WHERE ID(startNode) = row.startNodeId \
     MATCH (endNode) WHERE ID(endNode) = row.endNodeId \
     MATCH (startNode)-[rel:{}]->(endNode) DELETE rel",
    escape(rel_type)
  );
  Statement::new(text, rows, false)
}

/// Delete one batch of relationship entities, matched by edge identity and
/// optionally guarded by a version check
pub fn delete_relationship_entities(
  version_prop: Option<&str>,
  rows: Vec<serde_json::Value>,
) -> Statement {
  let text = match version_prop {
    Some(key) => format!(
      "UNWIND $rows AS row MATCH ()-[rel]->() WHERE ID(rel) = row.relId \
       AND rel.{} = row.version DELETE rel",
      escape(key)
    ),
    None => "UNWIND $rows AS row MATCH ()-[rel]->() WHERE ID(rel) = row.relId DELETE rel"
      .to_string(),
  };
  Statement::new(text, rows, version_prop.is_some())
}

// ============================================================================
// Tests
// ============================================================================
