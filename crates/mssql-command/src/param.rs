//! Typed parameters and the ordered parameter collection.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use mssql_keys::CipherMetadata;
use tds_rpc::{SqlType, WireValue};

/// Which way a parameter's value travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamDirection {
    /// Value goes to the server only.
    Input,
    /// Value comes back from the server only.
    Output,
    /// Value goes both ways.
    InputOutput,
    /// Receives the procedure's return status.
    ReturnValue,
}

impl ParamDirection {
    /// Whether the server may write this parameter back.
    #[must_use]
    pub fn is_output_like(&self) -> bool {
        matches!(self, Self::Output | Self::InputOutput | Self::ReturnValue)
    }

    /// Whether a value is sent to the server.
    #[must_use]
    pub fn sends_value(&self) -> bool {
        matches!(self, Self::Input | Self::InputOutput)
    }
}

/// One typed parameter of a command.
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Name, conventionally with the `@` prefix.
    pub name: String,
    /// Direction.
    pub direction: ParamDirection,
    /// Declared type.
    pub sql_type: SqlType,
    /// Declared size in the type's own units; `0` means unsized/PLP.
    pub size: usize,
    /// Precision, for decimal declarations.
    pub precision: u8,
    /// Scale, for decimal and fractional temporal declarations.
    pub scale: u8,
    /// Offset into a buffered value; carried for the data-adapter collaborator.
    pub offset: usize,
    /// Current value.
    pub value: WireValue,
    /// Cipher metadata stamped by the describe round trip or a cache hit.
    pub cipher: Option<CipherMetadata>,
    /// Set once the describe round trip has covered this parameter.
    pub has_received_metadata: bool,
    /// The type name was derived rather than declared by the caller.
    pub is_derived_type_name: bool,
    /// Collation delivered with a returned character value.
    pub collation: Option<[u8; 5]>,
    /// Multi-part type name for UDT parameters.
    pub udt_type_name: Option<String>,
}

impl Parameter {
    /// Create an input parameter with a NULL value.
    #[must_use]
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            direction: ParamDirection::Input,
            sql_type,
            size: 0,
            precision: 0,
            scale: 0,
            offset: 0,
            value: WireValue::Null,
            cipher: None,
            has_received_metadata: false,
            is_derived_type_name: false,
            collation: None,
            udt_type_name: None,
        }
    }

    /// Builder: set the value.
    #[must_use]
    pub fn with_value(mut self, value: WireValue) -> Self {
        self.value = value;
        self
    }

    /// Builder: set the direction.
    #[must_use]
    pub fn with_direction(mut self, direction: ParamDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Builder: set the declared size.
    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Builder: set precision and scale.
    #[must_use]
    pub fn with_precision_scale(mut self, precision: u8, scale: u8) -> Self {
        self.precision = precision;
        self.scale = scale;
        self
    }

    /// The name without its `@` prefix, for case-insensitive matching.
    #[must_use]
    pub fn bare_name(&self) -> &str {
        self.name.strip_prefix('@').unwrap_or(&self.name)
    }

    /// Whether `other` names this parameter, ignoring case and `@`.
    #[must_use]
    pub fn matches_name(&self, other: &str) -> bool {
        let other = other.strip_prefix('@').unwrap_or(other);
        self.bare_name().eq_ignore_ascii_case(other)
    }

    /// Clear per-execution encryption state.
    pub(crate) fn reset_cipher_state(&mut self) {
        self.cipher = None;
        self.has_received_metadata = false;
    }
}

/// Ordered parameter collection, addressable by ordinal and by name.
#[derive(Debug, Clone, Default)]
pub struct ParameterCollection {
    params: Vec<Parameter>,
}

impl ParameterCollection {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of parameters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Append a parameter.
    pub fn push(&mut self, param: Parameter) {
        self.params.push(param);
    }

    /// Remove all parameters.
    pub fn clear(&mut self) {
        self.params.clear();
    }

    /// Parameter by ordinal.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Parameter> {
        self.params.get(index)
    }

    /// Mutable parameter by ordinal.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Parameter> {
        self.params.get_mut(index)
    }

    /// Parameter by name, case-insensitively, ignoring the `@` prefix.
    #[must_use]
    pub fn get_by_name(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.matches_name(name))
    }

    /// Mutable parameter by name.
    pub fn get_by_name_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|p| p.matches_name(name))
    }

    /// Iterate the parameters in order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter()
    }

    /// Iterate the parameters mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Parameter> {
        self.params.iter_mut()
    }

    /// The first return-value parameter, if any.
    #[must_use]
    pub fn first_return_value(&self) -> Option<usize> {
        self.params
            .iter()
            .position(|p| p.direction == ParamDirection::ReturnValue)
    }

    /// Parameters that travel to the server (everything but return values).
    pub fn sendable(&self) -> impl Iterator<Item = &Parameter> {
        self.params
            .iter()
            .filter(|p| p.direction != ParamDirection::ReturnValue)
    }

    /// Number of sendable parameters.
    #[must_use]
    pub fn sendable_count(&self) -> usize {
        self.sendable().count()
    }

    /// Clear per-execution encryption state on every parameter.
    pub(crate) fn reset_cipher_state(&mut self) {
        for p in &mut self.params {
            p.reset_cipher_state();
        }
    }

    /// A stable fingerprint of the collection's shape.
    ///
    /// Covers names, declared types, sizes, precision/scale, and
    /// directions; changes whenever a re-prepare would be needed. Values
    /// do not participate.
    #[must_use]
    pub fn shape_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.params.len().hash(&mut hasher);
        for p in &self.params {
            p.bare_name().to_ascii_lowercase().hash(&mut hasher);
            p.sql_type.type_name().hash(&mut hasher);
            p.size.hash(&mut hasher);
            p.precision.hash(&mut hasher);
            p.scale.hash(&mut hasher);
            (p.direction as u8).hash(&mut hasher);
        }
        hasher.finish()
    }

    /// The shape portion of the query-metadata-cache fingerprint.
    #[must_use]
    pub fn shape_descriptor(&self) -> String {
        let mut out = String::new();
        for p in &self.params {
            out.push('@');
            out.push_str(&p.bare_name().to_ascii_lowercase());
            out.push(':');
            out.push_str(p.sql_type.type_name());
            out.push_str(&format!("({},{},{})", p.size, p.precision, p.scale));
            out.push(';');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_matching_ignores_case_and_prefix() {
        let p = Parameter::new("@UserId", SqlType::Int);
        assert!(p.matches_name("@userid"));
        assert!(p.matches_name("USERID"));
        assert!(!p.matches_name("@user"));
    }

    #[test]
    fn test_collection_lookup() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@a", SqlType::Int));
        params.push(Parameter::new("@b", SqlType::NVarChar).with_size(40));
        assert_eq!(params.len(), 2);
        assert!(params.get_by_name("B").is_some());
        assert!(params.get(1).is_some());
        assert!(params.get_by_name("@c").is_none());
    }

    #[test]
    fn test_first_return_value() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@a", SqlType::Int));
        params.push(
            Parameter::new("@ret", SqlType::Int).with_direction(ParamDirection::ReturnValue),
        );
        assert_eq!(params.first_return_value(), Some(1));
        assert_eq!(params.sendable_count(), 1);
    }

    #[test]
    fn test_shape_fingerprint_tracks_shape_not_values() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@x", SqlType::Int).with_value(WireValue::Int(1)));
        let before = params.shape_fingerprint();

        // Changing the value leaves the shape alone.
        params.get_mut(0).unwrap().value = WireValue::Int(99);
        assert_eq!(params.shape_fingerprint(), before);

        // Changing the size changes the shape.
        params.get_mut(0).unwrap().size = 8;
        assert_ne!(params.shape_fingerprint(), before);
    }

    #[test]
    fn test_shape_fingerprint_tracks_count() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@x", SqlType::Int));
        let one = params.shape_fingerprint();
        params.push(Parameter::new("@y", SqlType::Int));
        assert_ne!(params.shape_fingerprint(), one);
    }

    #[test]
    fn test_direction_predicates() {
        assert!(ParamDirection::InputOutput.is_output_like());
        assert!(ParamDirection::InputOutput.sends_value());
        assert!(!ParamDirection::Output.sends_value());
        assert!(ParamDirection::ReturnValue.is_output_like());
    }
}
