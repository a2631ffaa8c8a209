//! graphstitch - Object-graph change tracking and Cypher statement compilation
//!
//! Diffs live object graphs against the state a session last saw in the graph
//! store and compiles the difference into batched, parameterized statements.
//!
//! # Architecture
//!
//! A save pass runs in three stages:
//!
//! - **Snapshot**: per-session store of the last-known persisted state of
//!   every tracked node, relationship and relationship entity
//! - **Mapper**: depth-limited traversal of the live graph that diffs what it
//!   reaches against the snapshot and registers rows on the compiler
//! - **Compiler**: groups rows by statement shape and renders one
//!   `UNWIND $rows` statement per shape, in dependency order
//!
//! Nodes created in a batch are referenced symbolically (`"_0"`, `"_1"`, ...)
//! by dependent relationship rows; the session merges the generated
//! identities reported by the statement sink before those rows are rendered.
//!
//! # Features
//!
//! - One statement per shape, however many entities share it
//! - Optimistic locking via version-guarded updates
//! - Deletion scoped to what the traversal could actually see
//! - Relationship entities (edges with their own identity and properties)

#![deny(clippy::all)]

pub mod compiler;
pub mod error;
pub mod mapper;
pub mod metadata;
pub mod model;
pub mod session;
pub mod snapshot;
pub mod types;

// Re-export commonly used items
pub use error::{Result, StitchError};

pub use compiler::{CompileContext, Compiler, Statement};
pub use mapper::{EntityGraphMapper, UNBOUNDED};
pub use metadata::{IdentityKind, RefDef, TypeDef, TypeKind, TypeRegistry};
pub use model::{Entity, ObjKey, RefSlot};
pub use session::{Session, StatementResult, StatementSink};
pub use snapshot::{MappedRelationship, SnapshotStore};
pub use types::{Direction, EntityId, NodeRef, Properties, RowRef};
