//! Core type definitions shared across the mapper, compiler and session

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Internal (store-generated) identity of a persisted node or relationship
pub type EntityId = i64;

/// Property map carried by a node or relationship row.
///
/// BTreeMap keeps key order stable so rendered parameter maps are deterministic.
pub type Properties = BTreeMap<String, serde_json::Value>;

// ============================================================================
// Direction
// ============================================================================

/// Direction of a declared relationship field, read from entity metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
  Outgoing,
  Incoming,
  Undirected,
}

// ============================================================================
// Row References
// ============================================================================

/// Symbolic reference to a node row created in the current batch.
///
/// Assigned on first sight of an unpersisted object during traversal; the
/// statement sink reports the generated identity back keyed by this token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RowRef(pub u32);

impl RowRef {
  /// Token form used inside statement parameter maps (`"_0"`, `"_1"`, ...)
  pub fn token(&self) -> String {
    format!("_{}", self.0)
  }
}

impl fmt::Display for RowRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "_{}", self.0)
  }
}

impl FromStr for RowRef {
  type Err = ();

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    let digits = s.strip_prefix('_').ok_or(())?;
    digits.parse::<u32>().map(RowRef).map_err(|_| ())
  }
}

/// Reference to a node at either end of a relationship row.
///
/// Either a resolved store identity, or a pending row created in the same
/// batch whose identity is not yet known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
  Resolved(EntityId),
  Pending(RowRef),
}

impl NodeRef {
  pub fn is_pending(&self) -> bool {
    matches!(self, NodeRef::Pending(_))
  }

  /// Parameter-map form: resolved ids travel as numbers, pending rows as tokens
  pub fn to_param(&self) -> serde_json::Value {
    match self {
      NodeRef::Resolved(id) => serde_json::Value::from(*id),
      NodeRef::Pending(row) => serde_json::Value::from(row.token()),
    }
  }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_row_ref_token_round_trip() {
    let row = RowRef(42);
    assert_eq!(row.token(), "_42");
    assert_eq!("_42".parse::<RowRef>(), Ok(row));
  }

  #[test]
  fn test_row_ref_rejects_bad_tokens() {
    assert!("42".parse::<RowRef>().is_err());
    assert!("_".parse::<RowRef>().is_err());
    assert!("_x".parse::<RowRef>().is_err());
  }

  #[test]
  fn test_node_ref_params() {
    assert_eq!(NodeRef::Resolved(7).to_param(), serde_json::json!(7));
    assert_eq!(
      NodeRef::Pending(RowRef(3)).to_param(),
      serde_json::json!("_3")
    );
  }
}
