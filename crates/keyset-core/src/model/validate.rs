use crate::{model::entity::EntityModel, value::Row};
use std::{collections::BTreeMap, fmt};
use thiserror::Error as ThisError;

///
/// ValidationError
///
/// An instance failed its field constraints. Raised before anything is
/// buffered into a transaction.
///

#[derive(Debug, ThisError)]
#[error("invalid {entity}: {}", ErrorList(.errors))]
pub struct ValidationError {
    pub entity: &'static str,
    /// Field name → reason.
    pub errors: BTreeMap<String, String>,
}

impl ValidationError {
    #[must_use]
    pub fn single(entity: &'static str, field: &str, reason: impl Into<String>) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(field.to_string(), reason.into());

        Self { entity, errors }
    }
}

struct ErrorList<'a>(&'a BTreeMap<String, String>);

impl fmt::Display for ErrorList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, reason)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{field}: {reason}")?;
        }

        Ok(())
    }
}

/// Validate `row` against `model` and return it in canonical form.
///
/// Every problem is collected, not just the first. Unknown fields, link-set
/// fields present in the row, missing required fields and kind mismatches
/// are all errors.
pub fn validate_row(model: &'static EntityModel, row: &Row) -> Result<Row, ValidationError> {
    let mut errors = BTreeMap::new();
    let mut out = Row::new();

    for name in row.keys() {
        match model.field(name) {
            None => {
                errors.insert(name.clone(), "unknown field".to_string());
            }
            Some(field) if !field.is_stored() => {
                errors.insert(
                    name.clone(),
                    "link-set fields are not part of the row".to_string(),
                );
            }
            Some(_) => {}
        }
    }

    for field in model.stored_fields() {
        let value = row.get(field.name).cloned().unwrap_or_default();
        match field.coerce(&value) {
            Ok(value) if value.is_null() && field.required => {
                errors.insert(field.name.to_string(), "required".to_string());
            }
            Ok(value) => {
                out.insert(field.name.to_string(), value);
            }
            Err(reason) => {
                errors.insert(field.name.to_string(), reason);
            }
        }
    }

    if errors.is_empty() {
        Ok(out)
    } else {
        Err(ValidationError {
            entity: model.name,
            errors,
        })
    }
}
