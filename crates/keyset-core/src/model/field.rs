use crate::{
    model::entity::EntityModel,
    value::{Id, Value},
};

///
/// ScalarKind
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScalarKind {
    Bool,
    Int,
    Float,
    /// Short string, indexable but never split into search words.
    Str,
}

impl ScalarKind {
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }
}

///
/// FieldKind
///
/// Value-kind tag for one field: scalar, search text, or relation.
///

#[derive(Clone, Copy, Debug)]
pub enum FieldKind {
    Scalar(ScalarKind),

    /// Free text; contributes words to the search index.
    Text,

    /// Single-valued link to one instance of `target`, stored in the row and
    /// indexed like a scalar.
    ForeignKey(&'static EntityModel),

    /// Symmetric link set. Never stored in the row; each side owns a set of
    /// the other side's ids, and `related_name` names the reciprocal field
    /// on `target`.
    ManyToMany {
        target: &'static EntityModel,
        related_name: &'static str,
    },
}

///
/// FieldModel
/// Runtime field metadata used by the compiler, transactions and hooks.
///

#[derive(Debug)]
pub struct FieldModel {
    /// Field name as used in predicates and index keys.
    pub name: &'static str,
    pub kind: FieldKind,
    pub indexed: bool,
    pub unique: bool,
    pub required: bool,
}

impl FieldModel {
    #[must_use]
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            indexed: false,
            unique: false,
            required: false,
        }
    }

    #[must_use]
    pub const fn scalar(name: &'static str, kind: ScalarKind) -> Self {
        Self::new(name, FieldKind::Scalar(kind))
    }

    #[must_use]
    pub const fn text(name: &'static str) -> Self {
        Self::new(name, FieldKind::Text)
    }

    /// Foreign keys are always indexed; the index doubles as the reverse
    /// relation set.
    #[must_use]
    pub const fn foreign_key(name: &'static str, target: &'static EntityModel) -> Self {
        Self::new(name, FieldKind::ForeignKey(target)).indexed()
    }

    #[must_use]
    pub const fn many_to_many(
        name: &'static str,
        target: &'static EntityModel,
        related_name: &'static str,
    ) -> Self {
        Self::new(
            name,
            FieldKind::ManyToMany {
                target,
                related_name,
            },
        )
    }

    #[must_use]
    pub const fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Unique fields are required: a null value could never be looked up.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self.required = true;
        self
    }

    #[must_use]
    pub const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Stored in the instance row (everything except link sets).
    #[must_use]
    pub const fn is_stored(&self) -> bool {
        !matches!(self.kind, FieldKind::ManyToMany { .. })
    }

    /// Has an equality index set.
    #[must_use]
    pub const fn is_queryable(&self) -> bool {
        self.is_stored() && (self.indexed || self.unique)
    }

    /// Has a score-ordered index supporting range lookups.
    #[must_use]
    pub const fn is_ranged(&self) -> bool {
        self.indexed && matches!(self.kind, FieldKind::Scalar(kind) if kind.is_numeric())
    }

    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self.kind, FieldKind::Text)
    }

    #[must_use]
    pub const fn relation_target(&self) -> Option<&'static EntityModel> {
        match self.kind {
            FieldKind::ForeignKey(target) | FieldKind::ManyToMany { target, .. } => Some(target),
            FieldKind::Scalar(_) | FieldKind::Text => None,
        }
    }

    /// Coerce a caller-supplied value into this field's canonical form.
    ///
    /// Ints widen into float fields; text becomes a reference for foreign
    /// keys. Null passes through (required-ness is checked by validation).
    pub fn coerce(&self, value: &Value) -> Result<Value, String> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        match (self.kind, value) {
            (FieldKind::Scalar(ScalarKind::Bool), Value::Bool(_))
            | (FieldKind::Scalar(ScalarKind::Int), Value::Int(_))
            | (FieldKind::Scalar(ScalarKind::Str) | FieldKind::Text, Value::Text(_))
            | (FieldKind::ForeignKey(_), Value::Ref(_)) => Ok(value.clone()),

            (FieldKind::Scalar(ScalarKind::Float), Value::Float(v)) => {
                if v.is_nan() {
                    Err("NaN is not a storable float".to_string())
                } else {
                    Ok(value.clone())
                }
            }
            #[expect(clippy::cast_precision_loss)]
            (FieldKind::Scalar(ScalarKind::Float), Value::Int(v)) => Ok(Value::Float(*v as f64)),

            (FieldKind::ForeignKey(_), Value::Text(id)) => Ok(Value::Ref(Id::new(id.clone()))),

            (FieldKind::ManyToMany { .. }, _) => {
                Err("many-to-many fields are managed through link sets".to_string())
            }

            (kind, value) => Err(format!("value {value} does not fit field kind {kind:?}")),
        }
    }

    /// Canonical index token for `value` as stored in this field.
    pub fn index_token(&self, value: &Value) -> Result<Option<String>, String> {
        Ok(self.coerce(value)?.index_token())
    }
}
