use crate::model::field::{FieldKind, FieldModel};
use std::fmt;

///
/// EntityModel
/// Static runtime model for one entity.
///

pub struct EntityModel {
    /// Fully-qualified type path (for dispatch and diagnostics).
    pub path: &'static str,
    /// Stable external name used in backend keys. Names starting with `__`
    /// are reserved for engine namespaces.
    pub name: &'static str,
    /// Ordered field list, excluding the implicit `id` primary key.
    pub fields: &'static [FieldModel],
}

impl EntityModel {
    #[must_use]
    pub const fn new(path: &'static str, name: &'static str, fields: &'static [FieldModel]) -> Self {
        Self { path, name, fields }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&'static FieldModel> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Models are identified by path; two statics with the same path are
    /// the same model.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.path == other.path
    }

    pub fn stored_fields(&self) -> impl Iterator<Item = &'static FieldModel> {
        self.fields.iter().filter(|field| field.is_stored())
    }

    pub fn queryable_fields(&self) -> impl Iterator<Item = &'static FieldModel> {
        self.fields.iter().filter(|field| field.is_queryable())
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = &'static FieldModel> {
        self.fields
            .iter()
            .filter(|field| field.unique && field.is_stored())
    }

    pub fn text_fields(&self) -> impl Iterator<Item = &'static FieldModel> {
        self.fields.iter().filter(|field| field.is_text())
    }

    /// Many-to-many fields with their target model and reciprocal field name.
    pub fn link_fields(
        &self,
    ) -> impl Iterator<Item = (&'static FieldModel, &'static Self, &'static str)> {
        self.fields.iter().filter_map(|field| match field.kind {
            FieldKind::ManyToMany {
                target,
                related_name,
            } => Some((field, target, related_name)),
            FieldKind::Scalar(_) | FieldKind::Text | FieldKind::ForeignKey(_) => None,
        })
    }
}

// Models may reference each other cyclically, so Debug prints identity only.
impl fmt::Debug for EntityModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityModel({})", self.path)
    }
}

impl PartialEq for EntityModel {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for EntityModel {}

impl fmt::Display for EntityModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
