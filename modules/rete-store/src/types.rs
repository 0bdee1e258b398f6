//! Fact types. Domain-agnostic: entities are opaque ids, attributes are names,
//! values are a small closed set of scalars.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Attribute(Arc<str>);

impl Attribute {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Attribute {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Attribute {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    Ref(EntityId),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<EntityId> {
        match self {
            Value::Ref(e) => Some(*e),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Arc::from(s))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<EntityId> for Value {
    fn from(e: EntityId) -> Self {
        Value::Ref(e)
    }
}

// ---------------------------------------------------------------------------
// Triple / Datom
// ---------------------------------------------------------------------------

/// A fact as present in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub entity: EntityId,
    pub attribute: Attribute,
    pub value: Value,
}

impl Triple {
    pub fn new(entity: EntityId, attribute: impl Into<Attribute>, value: impl Into<Value>) -> Self {
        Self {
            entity,
            attribute: attribute.into(),
            value: value.into(),
        }
    }
}

/// The store's unit of change: a triple plus whether it was added or retracted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Datom {
    pub entity: EntityId,
    pub attribute: Attribute,
    pub value: Value,
    pub added: bool,
}

impl Datom {
    pub fn add(entity: EntityId, attribute: impl Into<Attribute>, value: impl Into<Value>) -> Self {
        Self {
            entity,
            attribute: attribute.into(),
            value: value.into(),
            added: true,
        }
    }

    pub fn retract(
        entity: EntityId,
        attribute: impl Into<Attribute>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            entity,
            attribute: attribute.into(),
            value: value.into(),
            added: false,
        }
    }

    pub fn triple(&self) -> Triple {
        Triple {
            entity: self.entity,
            attribute: self.attribute.clone(),
            value: self.value.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern
// ---------------------------------------------------------------------------

/// A triple mask. `None` components are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pattern {
    pub entity: Option<EntityId>,
    pub attribute: Option<Attribute>,
    pub value: Option<Value>,
}

impl Pattern {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn entity(entity: EntityId) -> Self {
        Self {
            entity: Some(entity),
            ..Self::default()
        }
    }

    pub fn attribute(attribute: impl Into<Attribute>) -> Self {
        Self {
            attribute: Some(attribute.into()),
            ..Self::default()
        }
    }

    pub fn entity_attribute(entity: EntityId, attribute: impl Into<Attribute>) -> Self {
        Self {
            entity: Some(entity),
            attribute: Some(attribute.into()),
            value: None,
        }
    }

    pub fn attribute_value(attribute: impl Into<Attribute>, value: impl Into<Value>) -> Self {
        Self {
            entity: None,
            attribute: Some(attribute.into()),
            value: Some(value.into()),
        }
    }

    pub fn exact(triple: &Triple) -> Self {
        Self {
            entity: Some(triple.entity),
            attribute: Some(triple.attribute.clone()),
            value: Some(triple.value.clone()),
        }
    }

    pub fn matches(&self, triple: &Triple) -> bool {
        self.entity.is_none_or(|e| e == triple.entity)
            && self.attribute.as_ref().is_none_or(|a| *a == triple.attribute)
            && self.value.as_ref().is_none_or(|v| *v == triple.value)
    }

    /// Every pattern that matches `triple`: each of the three components either
    /// fixed to the triple's value or wildcarded. A registration under any
    /// pattern matching the triple is found by looking up these eight keys.
    pub fn generalizations(triple: &Triple) -> [Pattern; 8] {
        std::array::from_fn(|mask| Pattern {
            entity: (mask & 0b100 != 0).then_some(triple.entity),
            attribute: (mask & 0b010 != 0).then(|| triple.attribute.clone()),
            value: (mask & 0b001 != 0).then(|| triple.value.clone()),
        })
    }
}
