//! Error types for graphstitch operations

use thiserror::Error;

/// Errors raised while mapping an object graph or applying compiled statements
#[derive(Debug, Error)]
pub enum StitchError {
  /// No descriptor was registered for the named entity type
  #[error("unknown entity type: {0}")]
  UnknownType(String),

  /// The registered metadata for a type is contradictory or incomplete
  #[error("ambiguous metadata for type {type_name}: {reason}")]
  AmbiguousMetadata { type_name: String, reason: String },

  /// A relationship entity is missing its start or end node
  #[error("relationship entity {type_name} is missing its {slot} node")]
  MissingEndpoint { type_name: String, slot: &'static str },

  /// A relationship entity cannot be mapped without its endpoints
  #[error("cannot map relationship entity {0} at depth 0")]
  InvalidDepth(String),

  /// An optimistic-lock guard matched fewer rows than were submitted
  #[error("stale state: expected {expected} rows, {affected} matched the version guard")]
  StaleState { expected: usize, affected: usize },

  /// The statement sink reported a generated id for a token we never issued
  #[error("sink returned unknown row reference: {0}")]
  BadRowReference(String),

  /// Failure reported by the statement sink during execution
  #[error("statement execution failed: {0}")]
  Backend(String),
}

/// Result type alias for graphstitch operations
pub type Result<T> = std::result::Result<T, StitchError>;
