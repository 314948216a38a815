//! Type tags shared between the value bridge and the operator pin
//! specifications.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::error::{Error, Result};

/// Kind of a server-side object referenced by a handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ObjectKind {
    Field,
    StringField,
    PropertyField,
    Scoping,
    FieldsContainer,
    ScopingsContainer,
    MeshedRegion,
    DataSources,
    TimeFreqSupport,
    Operator,
    Workflow,
    DataTree,
    GenericDataContainer,
    /// Untyped object, accepted by pins declared as `any`
    Any,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 14] = [
        ObjectKind::Field,
        ObjectKind::StringField,
        ObjectKind::PropertyField,
        ObjectKind::Scoping,
        ObjectKind::FieldsContainer,
        ObjectKind::ScopingsContainer,
        ObjectKind::MeshedRegion,
        ObjectKind::DataSources,
        ObjectKind::TimeFreqSupport,
        ObjectKind::Operator,
        ObjectKind::Workflow,
        ObjectKind::DataTree,
        ObjectKind::GenericDataContainer,
        ObjectKind::Any,
    ];

    /// Name used for this kind in operator pin specifications.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Field => "field",
            Self::StringField => "string_field",
            Self::PropertyField => "property_field",
            Self::Scoping => "scoping",
            Self::FieldsContainer => "fields_container",
            Self::ScopingsContainer => "scopings_container",
            Self::MeshedRegion => "abstract_meshed_region",
            Self::DataSources => "data_sources",
            Self::TimeFreqSupport => "time_freq_support",
            Self::Operator => "operator",
            Self::Workflow => "workflow",
            Self::DataTree => "abstract_data_tree",
            Self::GenericDataContainer => "generic_data_container",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

impl FromStr for ObjectKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        ObjectKind::ALL
            .iter()
            .find(|k| k.type_name() == s)
            .copied()
            .ok_or_else(|| Error::ParseError(format!("unknown object kind: {}", s)))
    }
}

/// Type tag selecting one variant of a value.
///
/// Outputs of an operator pin may advertise several types, so retrieval
/// always names the expected one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Int,
    Double,
    Bool,
    String,
    Bytes,
    IntList,
    DoubleList,
    StringList,
    LabelSpace,
    Object(ObjectKind),
}

impl ValueType {
    /// Name used for this type in operator pin specifications.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int => "int32",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::IntList => "vector<int32>",
            Self::DoubleList => "vector<double>",
            Self::StringList => "vector<string>",
            Self::LabelSpace => "label_space",
            Self::Object(kind) => kind.type_name(),
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        let t = match name.trim() {
            "int32" | "int" => Self::Int,
            "double" => Self::Double,
            "bool" => Self::Bool,
            "string" | "char" => Self::String,
            "bytes" => Self::Bytes,
            "vector<int32>" | "vector<int>" => Self::IntList,
            "vector<double>" => Self::DoubleList,
            "vector<string>" => Self::StringList,
            "label_space" => Self::LabelSpace,
            other => Self::Object(other.parse().ok()?),
        };
        Some(t)
    }

    /// Checks whether a pin declaring `accepted` type names takes a value of
    /// this type. An empty list or an `any` entry accepts everything.
    pub fn is_accepted_by<S: AsRef<str>>(&self, accepted: &[S]) -> bool {
        if accepted.is_empty() {
            return true;
        }
        accepted
            .iter()
            .any(|a| a.as_ref() == "any" || a.as_ref() == self.type_name())
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

/// Label to index map used to address entries of collections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpace {
    pub labels: BTreeMap<String, i32>,
}

impl LabelSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, label: &str, index: i32) -> Self {
        self.labels.insert(label.to_string(), index);
        self
    }

    pub fn get(&self, label: &str) -> Option<i32> {
        self.labels.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl<'a> From<&[(&'a str, i32)]> for LabelSpace {
    fn from(pairs: &[(&'a str, i32)]) -> Self {
        Self {
            labels: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_names_resolve_back() {
        for kind in ObjectKind::ALL.iter() {
            let t = ValueType::Object(*kind);
            assert_eq!(ValueType::from_type_name(t.type_name()), Some(t));
        }
        for t in &[
            ValueType::Int,
            ValueType::Double,
            ValueType::Bool,
            ValueType::String,
            ValueType::Bytes,
            ValueType::IntList,
            ValueType::DoubleList,
            ValueType::StringList,
            ValueType::LabelSpace,
        ] {
            assert_eq!(ValueType::from_type_name(t.type_name()), Some(*t));
        }
        assert_eq!(ValueType::from_type_name("nonsense"), None);
    }

    #[test]
    fn acceptance() {
        assert!(ValueType::Double.is_accepted_by(&["double", "field"]));
        assert!(!ValueType::String.is_accepted_by(&["double", "field"]));
        assert!(ValueType::Object(ObjectKind::Scoping).is_accepted_by(&["any"]));
        assert!(ValueType::Bool.is_accepted_by::<&str>(&[]));
    }

    #[test]
    fn label_space_builder() {
        let ls = LabelSpace::new().with("time", 1).with("complex", 0);
        assert_eq!(ls.get("time"), Some(1));
        assert_eq!(ls.len(), 2);
    }
}
