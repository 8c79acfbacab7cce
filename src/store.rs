//! Shared parameter store for the simulated IOC.
//!
//! Every named value the device exposes lives here: catalog defaults are
//! loaded at construction, and from then on the store is mutated concurrently
//! by the acquisition loop, the snapshot restore path, and external
//! protocol-driven writes routed through [`crate::driver::CameraDriver`].
//!
//! Each get/set is independently atomic (one `RwLock` guards the value map);
//! there is deliberately no multi-parameter transaction. A frame's data,
//! element count, and fiducial are published as three independent sets.
//!
//! Each slot also carries a seconds/nanoseconds timestamp, updated on every
//! set. The low 17 bits of the nanoseconds field can be overwritten with a
//! timing fiducial so downstream clients can correlate a frame with the
//! timing event that produced it.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use crate::error::{AppResult, CamError};
use crate::timing::FIDUCIAL_MASK;

// =============================================================================
// Values and specs
// =============================================================================

/// Declared type of a parameter, fixed for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
    Str,
    Bytes,
    Enum,
}

/// A parameter value as held in the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Enumeration ordinal.
    Enum(u16),
}

impl ParamValue {
    pub fn kind(&self) -> ParamType {
        match self {
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Str(_) => ParamType::Str,
            ParamValue::Bytes(_) => ParamType::Bytes,
            ParamValue::Enum(_) => ParamType::Enum,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            ParamValue::Enum(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Enum(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ParamValue::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// JSON form used by the snapshot document (numbers, strings, byte arrays).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Int(v) => serde_json::json!(v),
            ParamValue::Float(v) => serde_json::json!(v),
            ParamValue::Str(v) => serde_json::json!(v),
            ParamValue::Bytes(v) => serde_json::json!(v),
            ParamValue::Enum(v) => serde_json::json!(v),
        }
    }
}

/// Static description of one parameter, taken from the device catalog.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamType,
    pub default: ParamValue,
    /// External writes to this name are rejected.
    pub readonly: bool,
    /// Included in periodic snapshots.
    pub durable: bool,
    /// A changed write schedules a reconfiguration before the next frame.
    pub config: bool,
    /// Writes dispatch to a registered command handler.
    pub command: bool,
}

impl ParamSpec {
    /// New writable spec; the declared type is inferred from the default.
    pub fn new(name: impl Into<String>, default: ParamValue) -> Self {
        Self {
            name: name.into(),
            kind: default.kind(),
            default,
            readonly: false,
            durable: false,
            config: false,
            command: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn config(mut self) -> Self {
        self.config = true;
        self
    }

    pub fn command(mut self) -> Self {
        self.command = true;
        self
    }

    /// Type compatibility check. An enumeration accepts an integer value;
    /// everything else must match the declared type exactly.
    pub fn accepts(&self, value: &ParamValue) -> bool {
        let actual = value.kind();
        actual == self.kind || (self.kind == ParamType::Enum && actual == ParamType::Int)
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Per-slot update timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stamp {
    pub secs: u64,
    pub nsecs: u32,
}

impl Stamp {
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Self {
                secs: elapsed.as_secs(),
                nsecs: elapsed.subsec_nanos(),
            },
            Err(_) => Self::default(),
        }
    }

    /// Overwrite the low 17 bits of the nanoseconds field with a fiducial.
    pub fn patch_fiducial(&mut self, fiducial: u32) {
        self.nsecs = (self.nsecs & !FIDUCIAL_MASK) | (fiducial & FIDUCIAL_MASK);
    }
}

// =============================================================================
// ParameterStore
// =============================================================================

struct Slot {
    value: ParamValue,
    stamp: Stamp,
}

/// Thread-safe map of named parameter values plus their immutable specs.
pub struct ParameterStore {
    specs: HashMap<String, ParamSpec>,
    slots: RwLock<HashMap<String, Slot>>,
}

impl ParameterStore {
    /// Build the store from a catalog, seeding every slot with its default.
    pub fn from_catalog(catalog: Vec<ParamSpec>) -> Self {
        let mut specs = HashMap::with_capacity(catalog.len());
        let mut slots = HashMap::with_capacity(catalog.len());
        for spec in catalog {
            slots.insert(
                spec.name.clone(),
                Slot {
                    value: spec.default.clone(),
                    stamp: Stamp::now(),
                },
            );
            specs.insert(spec.name.clone(), spec);
        }
        Self {
            specs,
            slots: RwLock::new(slots),
        }
    }

    pub fn spec(&self, name: &str) -> Option<&ParamSpec> {
        self.specs.get(name)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// All parameter names, sorted.
    pub fn names_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of all parameters matching a tag predicate, sorted. Scans the
    /// full catalog, not current values, so the result is stable for the
    /// process lifetime.
    pub fn tagged<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&ParamSpec) -> bool,
    {
        let mut names: Vec<String> = self
            .specs
            .values()
            .filter(|spec| predicate(spec))
            .map(|spec| spec.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn get(&self, name: &str) -> Option<ParamValue> {
        self.slots.read().await.get(name).map(|slot| slot.value.clone())
    }

    /// Store a value after checking it against the declared type. Integer
    /// values written to enumeration parameters are converted to ordinals.
    pub async fn set(&self, name: &str, value: ParamValue) -> AppResult<()> {
        let spec = self
            .specs
            .get(name)
            .ok_or_else(|| CamError::UnknownParameter(name.to_string()))?;
        if !spec.accepts(&value) {
            return Err(CamError::TypeMismatch {
                name: name.to_string(),
                expected: spec.kind,
                actual: value.kind(),
            });
        }
        let value = match (spec.kind, value) {
            (ParamType::Enum, ParamValue::Int(v)) => ParamValue::Enum(v as u16),
            (_, value) => value,
        };
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(name) {
            slot.value = value;
            slot.stamp = Stamp::now();
        }
        Ok(())
    }

    pub async fn stamp(&self, name: &str) -> Option<Stamp> {
        self.slots.read().await.get(name).map(|slot| slot.stamp)
    }

    /// Tag a slot's timestamp with the fiducial of the timing event that
    /// produced its current value.
    pub async fn patch_fiducial(&self, name: &str, fiducial: u32) {
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(name) {
            slot.stamp.patch_fiducial(fiducial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_catalog() -> Vec<ParamSpec> {
        vec![
            ParamSpec::new("GAIN", ParamValue::Float(1.0)).durable(),
            ParamSpec::new("MODE", ParamValue::Enum(0)),
            ParamSpec::new("MODEL", ParamValue::Str("Opal1k".into())).read_only(),
            ParamSpec::new("COUNT", ParamValue::Int(7)),
        ]
    }

    #[tokio::test]
    async fn defaults_are_seeded() {
        let store = ParameterStore::from_catalog(small_catalog());
        assert_eq!(store.get("GAIN").await, Some(ParamValue::Float(1.0)));
        assert_eq!(store.get("MISSING").await, None);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn set_rejects_type_mismatch() {
        let store = ParameterStore::from_catalog(small_catalog());
        let err = store
            .set("GAIN", ParamValue::Str("oops".into()))
            .await
            .unwrap_err();
        match err {
            CamError::TypeMismatch { name, .. } => assert_eq!(name, "GAIN"),
            other => panic!("unexpected error: {other:?}"),
        }
        // Value unchanged after the rejected write
        assert_eq!(store.get("GAIN").await, Some(ParamValue::Float(1.0)));
    }

    #[tokio::test]
    async fn enum_accepts_integer_ordinal() {
        let store = ParameterStore::from_catalog(small_catalog());
        store.set("MODE", ParamValue::Int(3)).await.unwrap();
        assert_eq!(store.get("MODE").await, Some(ParamValue::Enum(3)));
    }

    #[tokio::test]
    async fn unknown_name_is_an_error() {
        let store = ParameterStore::from_catalog(small_catalog());
        assert!(matches!(
            store.set("MISSING", ParamValue::Int(1)).await,
            Err(CamError::UnknownParameter(_))
        ));
    }

    #[tokio::test]
    async fn tagged_names_are_sorted_and_stable() {
        let store = ParameterStore::from_catalog(small_catalog());
        assert_eq!(store.tagged(|s| s.durable), vec!["GAIN".to_string()]);
        assert_eq!(store.tagged(|s| s.readonly), vec!["MODEL".to_string()]);
    }

    #[tokio::test]
    async fn fiducial_patch_keeps_high_bits() {
        let store = ParameterStore::from_catalog(small_catalog());
        store.set("COUNT", ParamValue::Int(1)).await.unwrap();
        let before = store.stamp("COUNT").await.unwrap();
        store.patch_fiducial("COUNT", 0xABCDE).await;
        let after = store.stamp("COUNT").await.unwrap();
        assert_eq!(after.nsecs & FIDUCIAL_MASK, 0xABCDE & FIDUCIAL_MASK);
        assert_eq!(after.nsecs & !FIDUCIAL_MASK, before.nsecs & !FIDUCIAL_MASK);
        assert_eq!(after.secs, before.secs);
    }

    #[test]
    fn stamp_patch_masks_to_17_bits() {
        let mut stamp = Stamp {
            secs: 10,
            nsecs: 0xFFFF_FFFF,
        };
        stamp.patch_fiducial(0);
        assert_eq!(stamp.nsecs, 0xFFFF_FFFF & !FIDUCIAL_MASK);
    }
}
