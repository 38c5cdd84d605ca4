use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::record::Attributes;
use crate::BitemporalError;

/// Column names owned by the temporal bookkeeping, never usable as attributes.
pub const RESERVED_FIELDS: [&str; 6] =
    ["version_id", "entity_id", "valid_start", "valid_end", "tx_start", "tx_end"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Real,
    Boolean,
    Timestamp,
    Json,
}

impl FieldKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
        }
    }

    /// Whether a non-null JSON value fits this kind.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Real => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Timestamp => value
                .as_str()
                .is_some_and(|raw| OffsetDateTime::parse(raw, &Rfc3339).is_ok()),
            Self::Json => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

/// The attribute schema of one entity kind.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntitySchema {
    pub kind: String,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
}

impl EntitySchema {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), fields: BTreeMap::new() }
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind, required: bool) -> Self {
        self.fields.insert(name.into(), FieldSpec { kind, required });
        self
    }

    /// Check the schema definition itself.
    ///
    /// # Errors
    /// Returns [`BitemporalError::Validation`] for an empty kind, an empty
    /// field name, or a reserved field name.
    pub fn validate(&self) -> Result<(), BitemporalError> {
        if self.kind.trim().is_empty() {
            return Err(BitemporalError::Validation("schema kind MUST be non-empty".to_string()));
        }

        for name in self.fields.keys() {
            if name.trim().is_empty() {
                return Err(BitemporalError::Validation(format!(
                    "schema {} declares an empty field name",
                    self.kind
                )));
            }
            if RESERVED_FIELDS.contains(&name.as_str()) {
                return Err(BitemporalError::Validation(format!(
                    "schema {} declares reserved field {name}",
                    self.kind
                )));
            }
        }

        Ok(())
    }

    /// Check a complete attribute set: every required field present and
    /// non-null, every present field declared and well-typed.
    ///
    /// # Errors
    /// Returns [`BitemporalError::Validation`] describing the first violation.
    pub fn validate_attributes(&self, attributes: &Attributes) -> Result<(), BitemporalError> {
        self.validate_overrides(attributes)?;

        for (name, spec) in &self.fields {
            if spec.required && attributes.get(name).map_or(true, Value::is_null) {
                return Err(BitemporalError::Validation(format!(
                    "{}.{name} is required",
                    self.kind
                )));
            }
        }

        Ok(())
    }

    /// Check a partial override set against the declared fields.
    ///
    /// # Errors
    /// Returns [`BitemporalError::Validation`] for reserved, undeclared,
    /// mistyped, or nulled-out required fields.
    pub fn validate_overrides(&self, overrides: &Attributes) -> Result<(), BitemporalError> {
        for (name, value) in overrides {
            if RESERVED_FIELDS.contains(&name.as_str()) {
                return Err(BitemporalError::Validation(format!(
                    "{name} is a temporal field and cannot be set as an attribute"
                )));
            }

            let Some(spec) = self.fields.get(name) else {
                return Err(BitemporalError::Validation(format!(
                    "{}.{name} is not declared in the schema",
                    self.kind
                )));
            };

            if value.is_null() {
                if spec.required {
                    return Err(BitemporalError::Validation(format!(
                        "{}.{name} is required and cannot be null",
                        self.kind
                    )));
                }
                continue;
            }

            if !spec.kind.accepts(value) {
                return Err(BitemporalError::Validation(format!(
                    "{}.{name} expects {} but got {value}",
                    self.kind,
                    spec.kind.as_str()
                )));
            }
        }

        Ok(())
    }
}
