use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::session::DeviceCatalog;

/// A decoded field value as reported by the device protocol library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Numeric(f64),
    /// The name of an enumerated option, e.g. a charging mode
    Enum(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Numeric(v) => write!(f, "{v}"),
            FieldValue::Enum(v) => f.write_str(v),
        }
    }
}

/// The telemetry decoded by one successful read, keyed by field name.
///
/// Built once by the device session and shared with subscribers behind an
/// `Arc`, so it is never mutated after publication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap(BTreeMap<String, FieldValue>);

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.0.insert(field.into(), value);
        self
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.0.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, FieldValue)> for FieldMap {
    fn from_iter<T: IntoIterator<Item = (K, FieldValue)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// How a field is exposed as an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Sensor,
    BinarySensor,
    Switch,
    Select,
}

impl FieldKind {
    pub fn is_writable(self) -> bool {
        matches!(self, FieldKind::Switch | FieldKind::Select)
    }

    /// The entity platform name, used as unique id prefix
    pub fn platform(self) -> &'static str {
        match self {
            FieldKind::Sensor => "sensor",
            FieldKind::BinarySensor => "binary_sensor",
            FieldKind::Switch => "switch",
            FieldKind::Select => "select",
        }
    }

    /// Whether `value` has the shape this kind of entity expects.
    ///
    /// Selects additionally need the option to be one of `options`.
    pub fn accepts(self, value: &FieldValue, options: &[String]) -> bool {
        match (self, value) {
            (FieldKind::Sensor, _) => true,
            (FieldKind::BinarySensor | FieldKind::Switch, FieldValue::Bool(_)) => true,
            (FieldKind::Select, FieldValue::Enum(option)) => options.iter().any(|o| o == option),
            _ => false,
        }
    }
}

/// A select field and the names of its options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectField {
    pub name: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    /// Empty unless `kind` is `Select`
    pub options: Vec<String>,
}

/// Every field a device model exposes, enumerated once at setup.
#[derive(Debug, Clone, Default)]
pub struct FieldCatalog {
    fields: Vec<FieldSpec>,
    by_name: HashMap<String, usize>,
}

impl FieldCatalog {
    pub fn enumerate(device: &dyn DeviceCatalog) -> Self {
        let plain = |kind: FieldKind| {
            move |name: String| FieldSpec {
                name,
                kind,
                options: Vec::new(),
            }
        };

        let fields = device
            .sensor_fields()
            .into_iter()
            .map(plain(FieldKind::Sensor))
            .chain(device.bool_fields().into_iter().map(plain(FieldKind::BinarySensor)))
            .chain(device.switch_fields().into_iter().map(plain(FieldKind::Switch)))
            .chain(device.select_fields().into_iter().map(|s| FieldSpec {
                name: s.name,
                kind: FieldKind::Select,
                options: s.options,
            }));

        fields.collect()
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter()
    }

    pub fn writable(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.kind.is_writable())
    }
}

impl FromIterator<FieldSpec> for FieldCatalog {
    /// A field listed twice keeps its first kind.
    fn from_iter<T: IntoIterator<Item = FieldSpec>>(iter: T) -> Self {
        let mut catalog = FieldCatalog::default();
        for spec in iter {
            if catalog.by_name.contains_key(&spec.name) {
                continue;
            }
            catalog.by_name.insert(spec.name.clone(), catalog.fields.len());
            catalog.fields.push(spec);
        }
        catalog
    }
}
