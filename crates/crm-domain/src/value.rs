//! Modelo de registro dinámico: `FieldValue` (suma etiquetada) y `SObject`
//! (mapa ordenado api_name → valor).
//!
//! Reglas clave:
//! - Los nombres de campo se comparan case-insensitive pero se preserva la
//!   grafía original de la primera escritura.
//! - La conversión a/desde JSON es total: todo `FieldValue` tiene
//!   representación JSON y todo JSON se admite (los timestamps viajan como
//!   string RFC3339; la coerción tipada la decide el esquema en capas
//!   superiores).
//! - `to_storage` elimina campos virtuales (Formula / RollupSummary se
//!   materializan en la base, no se escriben).

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::EngineError;

/// Valor dinámico de un campo de registro.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(Value),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Un valor "en blanco" a efectos de required / ISBLANK: null o string
    /// vacío tras trim.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    /// Verdad booleana para condiciones de fórmula: false/0/""/null son
    /// falsos, el resto verdadero.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Text(s) => !s.is_empty(),
            Self::Timestamp(_) => true,
            Self::Json(v) => !v.is_null(),
            Self::Bytes(b) => !b.is_empty(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
            Self::Timestamp(ts) => Value::String(ts.to_rfc3339()),
            Self::Json(v) => v.clone(),
            Self::Bytes(b) => {
                Value::Array(b.iter().map(|x| Value::from(*x as i64)).collect())
            }
        }
    }

    /// Construye desde JSON sin esquema: enteros exactos quedan como `Int`,
    /// strings como `Text` (nunca se adivina Timestamp aquí).
    pub fn from_json(v: &Value) -> Self {
        match v {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    /// Representación string estable, usada por auditoría (old/new) y por la
    /// numeración automática.
    pub fn to_display_string(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Text(s) => s.clone(),
            Self::Timestamp(ts) => ts.to_rfc3339(),
            Self::Json(v) => v.to_string(),
            Self::Bytes(b) => format!("<{} bytes>", b.len()),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Ok(Self::from_json(&v))
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}
impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}
impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}
impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}
impl From<Uuid> for FieldValue {
    fn from(u: Uuid) -> Self {
        Self::Text(u.to_string())
    }
}
impl From<DateTime<Utc>> for FieldValue {
    fn from(ts: DateTime<Utc>) -> Self {
        Self::Timestamp(ts)
    }
}

/// Registro dinámico: mapa ordenado de api_name → `FieldValue`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SObject {
    fields: IndexMap<String, FieldValue>,
}

impl SObject {
    pub fn new() -> Self {
        Self::default()
    }

    /// Busca la clave almacenada que corresponde (case-insensitive) a `key`.
    fn stored_key(&self, key: &str) -> Option<&str> {
        self.fields
            .keys()
            .find(|k| k.eq_ignore_ascii_case(key))
            .map(|k| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        let k = self.stored_key(key)?;
        self.fields.get(k)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.stored_key(key).is_some()
    }

    /// Inserta preservando la grafía de la primera escritura de la clave.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        match self.stored_key(&key).map(str::to_string) {
            Some(existing) => {
                self.fields.insert(existing, value.into());
            }
            None => {
                self.fields.insert(key, value.into());
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        let k = self.stored_key(key)?.to_string();
        self.fields.shift_remove(&k)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn id(&self) -> Option<Uuid> {
        self.get(crate::object::system_fields::ID).and_then(|v| v.as_uuid())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_uuid(&self, key: &str) -> Option<Uuid> {
        self.get(key).and_then(|v| v.as_uuid())
    }

    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::with_capacity(self.fields.len());
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.to_json());
        }
        Value::Object(map)
    }

    pub fn from_json(v: &Value) -> Result<Self, EngineError> {
        let obj = v.as_object()
                   .ok_or_else(|| EngineError::Internal("record payload must be a JSON object".into()))?;
        let mut rec = Self::new();
        for (k, val) in obj {
            rec.set(k.clone(), FieldValue::from_json(val));
        }
        Ok(rec)
    }
}

impl Serialize for SObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        Self::from_json(&v).map_err(serde::de::Error::custom)
    }
}

impl FromIterator<(String, FieldValue)> for SObject {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        let mut rec = Self::new();
        for (k, v) in iter {
            rec.set(k, v);
        }
        rec
    }
}
