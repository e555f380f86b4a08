//! The host-facing field model. The host driver owns the real field
//! database; this module defines what the runtime declares to it and the
//! narrow interface it writes values and event triggers through.

use std::collections::BTreeMap;
use std::sync::Mutex;
use zwusb_core::definitions::NodeId;

pub type FieldId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Card,
    Int,
    Float,
    String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAccess {
    Read,
    Write,
    ReadWrite,
}

/// What the field means to the host, so its UI can pick sensible widgets
/// and trigger semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SemanticType {
    #[default]
    Generic,
    Switch,
    Dimmer,
    Motion,
    Door,
    Glass,
    Heat,
    Intrusion,
    Smoke,
    Tilt,
    Water,
    CO,
    CO2,
    CurrentTemp,
    LowSetPoint,
    HighSetPoint,
    ThermostatMode,
    LockState,
    BatteryLevel,
    Power,
    ColorRGB,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub ftype: FieldType,
    pub access: FieldAccess,
    pub semantic: SemanticType,
    /// Inclusive numeric range for card/int/float fields.
    pub limits: Option<(i64, i64)>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ftype: FieldType, access: FieldAccess) -> Self {
        Self {
            name: name.into(),
            ftype,
            access,
            semantic: SemanticType::default(),
            limits: None,
        }
    }

    pub fn semantic(mut self, semantic: SemanticType) -> Self {
        self.semantic = semantic;
        self
    }

    pub fn limits(mut self, min: i64, max: i64) -> Self {
        self.limits = Some((min, max));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Card(u32),
    Int(i64),
    Float(f64),
    String(String),
}

impl FieldValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_card(&self) -> Option<u32> {
        match self {
            FieldValue::Card(v) => Some(*v),
            FieldValue::Int(v) if *v >= 0 => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Card(v) => Some(*v as f64),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Outcome of routing a host field write into a CC implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWriteRes {
    /// Accepted; a protocol request went out.
    Sent,
    /// This impl does not own the field.
    Unhandled,
    /// Value failed validation; nothing was sent.
    Rejected,
    /// The owning unit cannot take traffic right now.
    NotViable,
}

/// An event trigger emitted toward the host.
#[derive(Debug, Clone, PartialEq)]
pub enum EventTrigger {
    Motion {
        node: NodeId,
        start: bool,
    },
    LoadChange {
        node: NodeId,
        on: bool,
    },
    LockStatus {
        node: NodeId,
        locked: bool,
        code: Option<u8>,
    },
    UserAction {
        node: NodeId,
        action: u32,
    },
}

/// What the host driver owes the runtime: field registration, value
/// writes, in-error marks and trigger delivery. The host's implementation
/// is assumed thread-safe and idempotent.
pub trait FieldStore: Send + Sync {
    fn register_field(&self, def: &FieldDef) -> FieldId;
    fn write_value(&self, id: FieldId, value: FieldValue);
    fn set_in_error(&self, id: FieldId, in_error: bool);
    fn emit_trigger(&self, trigger: EventTrigger);
}

#[derive(Default)]
struct MemoryFieldsInner {
    defs: Vec<FieldDef>,
    values: BTreeMap<FieldId, FieldValue>,
    errors: BTreeMap<FieldId, bool>,
    triggers: Vec<EventTrigger>,
}

/// An in-memory field store: the backing store for the cli binary and the
/// observation point for the scheduler and unit tests.
#[derive(Default)]
pub struct MemoryFieldStore {
    inner: Mutex<MemoryFieldsInner>,
}

impl MemoryFieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_of(&self, name: &str) -> Option<FieldId> {
        let inner = self.inner.lock().expect("field store lock poisoned");
        inner
            .defs
            .iter()
            .position(|d| d.name == name)
            .map(|p| p as FieldId)
    }

    pub fn def_of(&self, id: FieldId) -> Option<FieldDef> {
        let inner = self.inner.lock().expect("field store lock poisoned");
        inner.defs.get(id as usize).cloned()
    }

    pub fn value_of(&self, id: FieldId) -> Option<FieldValue> {
        let inner = self.inner.lock().expect("field store lock poisoned");
        inner.values.get(&id).cloned()
    }

    pub fn value_by_name(&self, name: &str) -> Option<FieldValue> {
        let id = self.id_of(name)?;
        self.value_of(id)
    }

    pub fn in_error(&self, id: FieldId) -> bool {
        let inner = self.inner.lock().expect("field store lock poisoned");
        inner.errors.get(&id).copied().unwrap_or(false)
    }

    pub fn triggers(&self) -> Vec<EventTrigger> {
        let inner = self.inner.lock().expect("field store lock poisoned");
        inner.triggers.clone()
    }

    pub fn field_count(&self) -> usize {
        let inner = self.inner.lock().expect("field store lock poisoned");
        inner.defs.len()
    }
}

impl FieldStore for MemoryFieldStore {
    fn register_field(&self, def: &FieldDef) -> FieldId {
        let mut inner = self.inner.lock().expect("field store lock poisoned");
        inner.defs.push(def.clone());
        (inner.defs.len() - 1) as FieldId
    }

    fn write_value(&self, id: FieldId, value: FieldValue) {
        let mut inner = self.inner.lock().expect("field store lock poisoned");
        inner.values.insert(id, value);
        inner.errors.insert(id, false);
    }

    fn set_in_error(&self, id: FieldId, in_error: bool) {
        let mut inner = self.inner.lock().expect("field store lock poisoned");
        inner.errors.insert(id, in_error);
    }

    fn emit_trigger(&self, trigger: EventTrigger) {
        let mut inner = self.inner.lock().expect("field store lock poisoned");
        inner.triggers.push(trigger);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_register_and_write() {
        let store = MemoryFieldStore::new();
        let id = store.register_field(&FieldDef::new(
            "Unit_Switch",
            FieldType::Bool,
            FieldAccess::ReadWrite,
        ));
        assert_eq!(store.id_of("Unit_Switch"), Some(id));

        store.write_value(id, FieldValue::Bool(true));
        assert_eq!(store.value_of(id), Some(FieldValue::Bool(true)));
        assert!(!store.in_error(id));
    }

    #[test]
    fn test_error_marking_cleared_by_write() {
        let store = MemoryFieldStore::new();
        let id = store.register_field(&FieldDef::new(
            "Unit_Level",
            FieldType::Card,
            FieldAccess::ReadWrite,
        ));
        store.set_in_error(id, true);
        assert!(store.in_error(id));

        store.write_value(id, FieldValue::Card(55));
        assert!(!store.in_error(id));
    }
}
