//! Dynamic entity model
//!
//! Entities are cheap-clone handles with reference semantics: cloning a handle
//! aliases the same underlying instance, so an object graph built from handles
//! can contain cycles and shared nodes exactly like a pointer-based domain
//! model. The mapper keys its visited set on the handle's allocation identity.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::types::{EntityId, Properties};

// ============================================================================
// Entity Handle
// ============================================================================

/// Handle to a live entity instance
#[derive(Clone)]
pub struct Entity {
  inner: Rc<RefCell<EntityData>>,
}

#[derive(Debug)]
struct EntityData {
  type_name: String,
  id: Option<EntityId>,
  props: Properties,
  refs: HashMap<String, RefSlot>,
}

/// Value of a reference slot: one related entity or a collection of them
#[derive(Debug, Clone)]
pub enum RefSlot {
  One(Entity),
  Many(Vec<Entity>),
}

/// Identity key for an entity instance, stable for the handle's lifetime.
///
/// Derived from the allocation pointer; two handles compare equal here exactly
/// when they alias the same instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjKey(usize);

impl Entity {
  /// Create a new, unpersisted instance of the named type
  pub fn new(type_name: impl Into<String>) -> Self {
    Self {
      inner: Rc::new(RefCell::new(EntityData {
        type_name: type_name.into(),
        id: None,
        props: Properties::new(),
        refs: HashMap::new(),
      })),
    }
  }

  /// Create an instance that already carries a store identity
  pub fn with_id(type_name: impl Into<String>, id: EntityId) -> Self {
    let entity = Self::new(type_name);
    entity.set_id(Some(id));
    entity
  }

  pub fn type_name(&self) -> String {
    self.inner.borrow().type_name.clone()
  }

  pub fn id(&self) -> Option<EntityId> {
    self.inner.borrow().id
  }

  pub fn set_id(&self, id: Option<EntityId>) {
    self.inner.borrow_mut().id = id;
  }

  /// Identity key of this instance
  pub fn key(&self) -> ObjKey {
    ObjKey(Rc::as_ptr(&self.inner) as usize)
  }

  /// True if both handles alias the same instance
  pub fn same_instance(&self, other: &Entity) -> bool {
    Rc::ptr_eq(&self.inner, &other.inner)
  }

  // --------------------------------------------------------------------------
  // Properties
  // --------------------------------------------------------------------------

  pub fn set_prop(&self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> &Self {
    self.inner.borrow_mut().props.insert(key.into(), value.into());
    self
  }

  pub fn prop(&self, key: &str) -> Option<serde_json::Value> {
    self.inner.borrow().props.get(key).cloned()
  }

  /// Snapshot of the current property map
  pub fn props(&self) -> Properties {
    self.inner.borrow().props.clone()
  }

  // --------------------------------------------------------------------------
  // Reference Slots
  // --------------------------------------------------------------------------

  /// Point a single-valued reference slot at another entity
  pub fn set_ref(&self, field: impl Into<String>, target: &Entity) {
    self
      .inner
      .borrow_mut()
      .refs
      .insert(field.into(), RefSlot::One(target.clone()));
  }

  /// Append an entity to a collection-valued reference slot
  pub fn push_ref(&self, field: impl Into<String>, target: &Entity) {
    let mut data = self.inner.borrow_mut();
    let slot = data
      .refs
      .entry(field.into())
      .or_insert_with(|| RefSlot::Many(Vec::new()));
    match slot {
      RefSlot::Many(items) => items.push(target.clone()),
      RefSlot::One(existing) => {
        let existing = existing.clone();
        *slot = RefSlot::Many(vec![existing, target.clone()]);
      }
    }
  }

  /// Empty a reference slot without removing the field itself
  pub fn clear_ref(&self, field: &str) {
    self
      .inner
      .borrow_mut()
      .refs
      .insert(field.to_string(), RefSlot::Many(Vec::new()));
  }

  /// Remove one entity from a collection-valued slot, matched by instance
  pub fn remove_ref(&self, field: &str, target: &Entity) {
    if let Some(RefSlot::Many(items)) = self.inner.borrow_mut().refs.get_mut(field) {
      items.retain(|item| !item.same_instance(target));
    }
  }

  /// All entities currently reachable through the named slot
  pub fn refs(&self, field: &str) -> Vec<Entity> {
    match self.inner.borrow().refs.get(field) {
      Some(RefSlot::One(entity)) => vec![entity.clone()],
      Some(RefSlot::Many(items)) => items.clone(),
      None => Vec::new(),
    }
  }

  /// Single entity in the named slot, if the slot holds exactly one
  pub fn single_ref(&self, field: &str) -> Option<Entity> {
    let mut targets = self.refs(field);
    if targets.len() == 1 {
      targets.pop()
    } else {
      None
    }
  }

  // --------------------------------------------------------------------------
  // Metadata-Driven Reads
  // --------------------------------------------------------------------------

  /// Properties persisted for this instance: the declared keys that are set
  pub(crate) fn persistable_props(&self, def: &crate::metadata::TypeDef) -> Properties {
    let data = self.inner.borrow();
    let mut props = Properties::new();
    for key in &def.properties {
      if let Some(value) = data.props.get(key) {
        props.insert(key.clone(), value.clone());
      }
    }
    props
  }

  /// Current optimistic-lock counter, when the type declares one
  pub(crate) fn version_value(&self, def: &crate::metadata::TypeDef) -> Option<i64> {
    let key = def.version_prop.as_deref()?;
    self.inner.borrow().props.get(key).and_then(|v| v.as_i64())
  }
}

impl fmt::Debug for Entity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let data = self.inner.borrow();
    f.debug_struct("Entity")
      .field("type", &data.type_name)
      .field("id", &data.id)
      .field("props", &data.props)
      .finish()
  }
}

// ============================================================================
// Tests
// ============================================================================
