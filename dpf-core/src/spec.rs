//! Operator specification definitions.

use std::collections::BTreeMap;

use crate::value::ValueType;

/// Declaration of a single operator pin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PinSpecification {
    pub name: String,
    /// Names of the accepted (inputs) or produced (outputs) types
    pub type_names: Vec<String>,
    pub optional: bool,
    /// Pin is repeated for every following index
    pub ellipsis: bool,
    pub document: String,
}

impl PinSpecification {
    pub fn new(name: &str, type_names: &[&str], optional: bool, document: &str) -> Self {
        Self {
            name: name.to_string(),
            type_names: type_names.iter().map(|s| s.to_string()).collect(),
            optional,
            ellipsis: false,
            document: document.to_string(),
        }
    }

    pub fn with_ellipsis(mut self) -> Self {
        self.ellipsis = true;
        self
    }

    /// Value types this pin declares, skipping names that have no
    /// client-side type.
    pub fn value_types(&self) -> Vec<ValueType> {
        self.type_names
            .iter()
            .filter_map(|n| ValueType::from_type_name(n))
            .collect()
    }

    pub fn accepts(&self, value_type: ValueType) -> bool {
        value_type.is_accepted_by(&self.type_names)
    }
}

/// Declaration of a configuration option.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigOptionSpec {
    pub name: String,
    pub type_names: Vec<String>,
    pub default_value: String,
    pub document: String,
}

/// Full description of an operator as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Specification {
    pub description: String,
    pub inputs: BTreeMap<i32, PinSpecification>,
    pub outputs: BTreeMap<i32, PinSpecification>,
    pub config_options: BTreeMap<String, ConfigOptionSpec>,
    /// Free-form properties, e.g. `category`, `exposure`, `pure`
    pub properties: BTreeMap<String, String>,
}

impl Specification {
    /// Finds the input pin governing `pin`, following ellipsis pins.
    pub fn input_pin(&self, pin: i32) -> Option<&PinSpecification> {
        if let Some(spec) = self.inputs.get(&pin) {
            return Some(spec);
        }
        self.inputs
            .range(..pin)
            .next_back()
            .filter(|(_, spec)| spec.ellipsis)
            .map(|(_, spec)| spec)
    }

    pub fn output_pin(&self, pin: i32) -> Option<&PinSpecification> {
        self.outputs.get(&pin)
    }

    /// Operators declared pure always produce the same outputs for the same
    /// inputs, making their getters safe to memoize on the client.
    pub fn is_pure(&self) -> bool {
        self.properties
            .get("pure")
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> Specification {
        let mut spec = Specification::default();
        spec.inputs
            .insert(0, PinSpecification::new("field", &["field", "vector<double>"], false, ""));
        spec.inputs.insert(
            2,
            PinSpecification::new("extra", &["double"], true, "").with_ellipsis(),
        );
        spec.outputs
            .insert(0, PinSpecification::new("min", &["double"], false, ""));
        spec
    }

    #[test]
    fn ellipsis_pins_cover_following_indices() {
        let spec = spec();
        assert_eq!(spec.input_pin(0).unwrap().name, "field");
        assert!(spec.input_pin(1).is_none());
        assert_eq!(spec.input_pin(2).unwrap().name, "extra");
        assert_eq!(spec.input_pin(7).unwrap().name, "extra");
    }

    #[test]
    fn pin_value_types() {
        let spec = spec();
        let pin = spec.input_pin(0).unwrap();
        assert_eq!(pin.value_types().len(), 2);
        assert!(pin.accepts(ValueType::DoubleList));
        assert!(!pin.accepts(ValueType::String));
    }

    #[test]
    fn purity_property() {
        let mut spec = spec();
        assert!(!spec.is_pure());
        spec.properties.insert("pure".to_string(), "true".to_string());
        assert!(spec.is_pure());
    }
}
