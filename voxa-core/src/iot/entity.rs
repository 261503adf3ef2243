//! IoT entity descriptors and live property state.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{Value, ValueType};

/// A declared, observable property of an entity.
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub description: String,
    pub value_type: ValueType,
    /// State the property starts in; published with the first forced
    /// full-state envelope after a session handshake.
    pub initial: Value,
}

impl Property {
    /// # Panics
    /// Panics if `initial` does not match `value_type` — a schema bug in
    /// the registering code, not a runtime condition.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        value_type: ValueType,
        initial: impl Into<Value>,
    ) -> Self {
        let name = name.into();
        let initial = initial.into();
        assert!(
            initial.value_type() == value_type,
            "property '{}' declared {:?} but initial value is {:?}",
            name,
            value_type,
            initial.value_type(),
        );
        Self {
            name,
            description: description.into(),
            value_type,
            initial,
        }
    }
}

/// A parameter of an invokable method.
#[derive(Debug, Clone)]
pub struct MethodParam {
    pub name: String,
    pub description: String,
    pub value_type: ValueType,
    pub required: bool,
}

impl MethodParam {
    pub fn required(
        name: impl Into<String>,
        description: impl Into<String>,
        value_type: ValueType,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            value_type,
            required: true,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        description: impl Into<String>,
        value_type: ValueType,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            value_type,
            required: false,
        }
    }
}

/// A method the backend may invoke on an entity.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub description: String,
    pub parameters: Vec<MethodParam>,
}

impl Method {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<MethodParam>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A locally-controlled device exposed to the backend.
///
/// Shared between the host application (which performs side effects and
/// calls [`Entity::update`]) and the registry (which publishes state).
/// The descriptor is immutable after construction; only `states` mutates,
/// behind a leaf lock held for single map operations.
pub struct Entity {
    name: String,
    description: String,
    properties: HashMap<String, Property>,
    methods: HashMap<String, Method>,
    states: Mutex<HashMap<String, Value>>,
}

impl Entity {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        properties: Vec<Property>,
        methods: Vec<Method>,
    ) -> Self {
        let states = properties
            .iter()
            .map(|p| (p.name.clone(), p.initial.clone()))
            .collect();
        Self {
            name: name.into(),
            description: description.into(),
            properties: properties.into_iter().map(|p| (p.name.clone(), p)).collect(),
            methods: methods.into_iter().map(|m| (m.name.clone(), m)).collect(),
            states: Mutex::new(states),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn properties(&self) -> &HashMap<String, Property> {
        &self.properties
    }

    pub fn methods(&self) -> &HashMap<String, Method> {
        &self.methods
    }

    /// Publish a new value for a declared property.
    ///
    /// # Panics
    /// Panics when the property is undeclared or the value's type does not
    /// match the declaration. Both are programming errors in the host
    /// application: the schema was already advertised to the backend and
    /// cannot be violated at runtime.
    pub fn update(&self, property: &str, value: impl Into<Value>) {
        let value = value.into();
        let declared = self
            .properties
            .get(property)
            .unwrap_or_else(|| panic!("entity '{}' has no property '{}'", self.name, property));
        assert!(
            value.value_type() == declared.value_type,
            "entity '{}' property '{}' declared {:?} but assigned {:?}",
            self.name,
            property,
            declared.value_type,
            value.value_type(),
        );
        self.states.lock().insert(property.to_string(), value);
    }

    /// Snapshot of the current property states.
    pub fn states(&self) -> HashMap<String, Value> {
        self.states.lock().clone()
    }
}
