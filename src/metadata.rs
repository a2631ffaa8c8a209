//! Entity metadata registry
//!
//! Descriptors are the pre-resolved stand-in for reflection-driven class
//! metadata: per type they carry labels, identity kind, property keys,
//! declared references and the optional version property. The registry is
//! read-only once built and can be shared across sessions.

use std::collections::HashMap;

use crate::error::{Result, StitchError};
use crate::types::Direction;

// ============================================================================
// Identity
// ============================================================================

/// How instances of a type are identified in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityKind {
  /// Store-generated internal id; new instances are created with CREATE
  Internal,
  /// User-assigned primary index property; new instances are merged by it
  PrimaryIndex(String),
}

// ============================================================================
// Reference Declarations
// ============================================================================

/// A declared relationship field on an entity type
#[derive(Debug, Clone)]
pub struct RefDef {
  /// Name of the reference slot on the instance
  pub field: String,
  /// Relationship type name written to the graph
  pub rel_type: String,
  /// Type name of the referenced entity
  pub target_type: String,
  /// Direction of the relationship as seen from the declaring type
  pub direction: Direction,
  /// Whether the referenced type is a relationship entity
  pub relationship_entity: bool,
}

impl RefDef {
  /// Declare an outgoing reference; use the builder methods to change direction
  pub fn new(
    field: impl Into<String>,
    rel_type: impl Into<String>,
    target_type: impl Into<String>,
  ) -> Self {
    Self {
      field: field.into(),
      rel_type: rel_type.into(),
      target_type: target_type.into(),
      direction: Direction::Outgoing,
      relationship_entity: false,
    }
  }

  pub fn incoming(mut self) -> Self {
    self.direction = Direction::Incoming;
    self
  }

  pub fn undirected(mut self) -> Self {
    self.direction = Direction::Undirected;
    self
  }

  /// Mark the target type as a relationship entity (edge with own properties)
  pub fn relationship_entity(mut self) -> Self {
    self.relationship_entity = true;
    self
  }
}

// ============================================================================
// Type Descriptors
// ============================================================================

/// Node type vs relationship-entity type
#[derive(Debug, Clone)]
pub enum TypeKind {
  Node,
  /// An edge carrying its own identity and properties
  RelationshipEntity {
    rel_type: String,
    start_field: String,
    end_field: String,
  },
}

/// Descriptor for one entity type
#[derive(Debug, Clone)]
pub struct TypeDef {
  pub name: String,
  pub kind: TypeKind,
  /// Ordered label set; defaults to the type name
  pub labels: Vec<String>,
  pub identity: IdentityKind,
  /// Property keys persisted from the instance property map
  pub properties: Vec<String>,
  pub references: Vec<RefDef>,
  /// Property holding the optimistic-lock counter, if the type is versioned
  pub version_prop: Option<String>,
}

impl TypeDef {
  /// Declare a node type with a single label equal to the type name
  pub fn node(name: impl Into<String>) -> Self {
    let name = name.into();
    Self {
      labels: vec![name.clone()],
      name,
      kind: TypeKind::Node,
      identity: IdentityKind::Internal,
      properties: Vec::new(),
      references: Vec::new(),
      version_prop: None,
    }
  }

  /// Declare a relationship-entity type with designated start/end slots
  pub fn relationship(
    name: impl Into<String>,
    rel_type: impl Into<String>,
    start_field: impl Into<String>,
    end_field: impl Into<String>,
  ) -> Self {
    let name = name.into();
    Self {
      labels: Vec::new(),
      name,
      kind: TypeKind::RelationshipEntity {
        rel_type: rel_type.into(),
        start_field: start_field.into(),
        end_field: end_field.into(),
      },
      identity: IdentityKind::Internal,
      properties: Vec::new(),
      references: Vec::new(),
      version_prop: None,
    }
  }

  /// Add an extra label to the label set
  pub fn label(mut self, label: impl Into<String>) -> Self {
    self.labels.push(label.into());
    self
  }

  pub fn prop(mut self, key: impl Into<String>) -> Self {
    self.properties.push(key.into());
    self
  }

  pub fn reference(mut self, reference: RefDef) -> Self {
    self.references.push(reference);
    self
  }

  /// Merge new instances by the given property instead of creating blindly
  pub fn primary_index(mut self, key: impl Into<String>) -> Self {
    self.identity = IdentityKind::PrimaryIndex(key.into());
    self
  }

  /// Guard updates of this type with an optimistic-lock counter property
  pub fn versioned(mut self, key: impl Into<String>) -> Self {
    self.version_prop = Some(key.into());
    self
  }

  pub fn is_relationship_entity(&self) -> bool {
    matches!(self.kind, TypeKind::RelationshipEntity { .. })
  }

  /// Relationship type name for relationship-entity descriptors
  pub fn rel_type(&self) -> Option<&str> {
    match &self.kind {
      TypeKind::RelationshipEntity { rel_type, .. } => Some(rel_type),
      TypeKind::Node => None,
    }
  }

  /// Stable signature of the label set, used to group node rows into batches
  pub fn label_signature(&self) -> String {
    self.labels.join(":")
  }

  fn validate(&self) -> Result<()> {
    let ambiguous = |reason: &str| StitchError::AmbiguousMetadata {
      type_name: self.name.clone(),
      reason: reason.to_string(),
    };

    if let IdentityKind::PrimaryIndex(key) = &self.identity {
      if !self.properties.contains(key) {
        return Err(ambiguous("primary index is not a declared property"));
      }
      if self.is_relationship_entity() {
        return Err(ambiguous("relationship entities cannot merge by primary index"));
      }
    }
    if let Some(version) = &self.version_prop {
      if self.properties.contains(version) {
        return Err(ambiguous("version property must not be a plain property"));
      }
    }
    if let TypeKind::RelationshipEntity { start_field, end_field, .. } = &self.kind {
      if start_field == end_field {
        return Err(ambiguous("start and end slots must differ"));
      }
      if !self.references.is_empty() {
        return Err(ambiguous("relationship entities may not declare references"));
      }
    }
    let mut seen = std::collections::HashSet::new();
    for reference in &self.references {
      if !seen.insert(reference.field.as_str()) {
        return Err(ambiguous("duplicate reference field"));
      }
    }
    Ok(())
  }
}

// ============================================================================
// Registry
// ============================================================================

/// Read-only lookup from type name to descriptor
#[derive(Debug, Default)]
pub struct TypeRegistry {
  types: HashMap<String, TypeDef>,
}

impl TypeRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a descriptor, validating it first
  pub fn register(&mut self, def: TypeDef) -> Result<()> {
    def.validate()?;
    if self.types.contains_key(&def.name) {
      return Err(StitchError::AmbiguousMetadata {
        type_name: def.name,
        reason: "type registered twice".to_string(),
      });
    }
    self.types.insert(def.name.clone(), def);
    Ok(())
  }

  pub fn get(&self, type_name: &str) -> Result<&TypeDef> {
    self
      .types
      .get(type_name)
      .ok_or_else(|| StitchError::UnknownType(type_name.to_string()))
  }

  pub fn contains(&self, type_name: &str) -> bool {
    self.types.contains_key(type_name)
  }

  /// True if the named type is a registered relationship entity
  pub fn is_relationship_entity(&self, type_name: &str) -> bool {
    self
      .types
      .get(type_name)
      .map(|def| def.is_relationship_entity())
      .unwrap_or(false)
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_node_descriptor_defaults() {
    let def = TypeDef::node("Teacher").prop("name");
    assert_eq!(def.labels, vec!["Teacher"]);
    assert_eq!(def.label_signature(), "Teacher");
    assert!(!def.is_relationship_entity());
  }

  #[test]
  fn test_extra_labels_extend_signature() {
    let def = TypeDef::node("Teacher").label("Person");
    assert_eq!(def.label_signature(), "Teacher:Person");
  }

  #[test]
  fn test_duplicate_registration_is_ambiguous() {
    let mut registry = TypeRegistry::new();
    registry.register(TypeDef::node("Teacher")).unwrap();
    let err = registry.register(TypeDef::node("Teacher")).unwrap_err();
    assert!(matches!(err, StitchError::AmbiguousMetadata { .. }));
  }

  #[test]
  fn test_primary_index_must_be_declared() {
    let mut registry = TypeRegistry::new();
    let err = registry
      .register(TypeDef::node("Book").primary_index("isbn"))
      .unwrap_err();
    assert!(matches!(err, StitchError::AmbiguousMetadata { .. }));

    registry
      .register(TypeDef::node("Book2").prop("isbn").primary_index("isbn"))
      .unwrap();
  }

  #[test]
  fn test_relationship_entity_endpoints_must_differ() {
    let mut registry = TypeRegistry::new();
    let err = registry
      .register(TypeDef::relationship("Loop", "LOOP", "node", "node"))
      .unwrap_err();
    assert!(matches!(err, StitchError::AmbiguousMetadata { .. }));
  }

  #[test]
  fn test_unknown_type_lookup() {
    let registry = TypeRegistry::new();
    assert!(matches!(
      registry.get("Ghost").unwrap_err(),
      StitchError::UnknownType(_)
    ));
  }
}
