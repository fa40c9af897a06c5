use crate::{
    model::entity::EntityModel,
    value::{Id, Row},
};

///
/// EntityKind
///
/// Binding between a Rust type and its static [`EntityModel`]. This is the
/// model-registration surface the engine consumes: identity, row conversion,
/// and instance construction from stored data.
///

pub trait EntityKind: Clone + Send + Sync + Sized + 'static {
    const MODEL: &'static EntityModel;

    /// Primary key, or `None` for an instance that was never saved.
    fn id(&self) -> Option<&Id>;

    fn set_id(&mut self, id: Id);

    /// Stored field values, keyed by field name. Link-set fields are not
    /// part of the row.
    fn to_row(&self) -> Row;

    /// Build an instance from its id and stored field values.
    fn from_row(id: Id, row: Row) -> Result<Self, crate::Error>;
}

/// Read the id of a saved instance or report that it has none.
pub(crate) fn require_id<E: EntityKind>(entity: &E) -> Result<&Id, crate::Error> {
    entity.id().ok_or_else(|| {
        crate::model::validate::ValidationError::single(
            E::MODEL.name,
            crate::PRIMARY_KEY,
            "instance has not been saved",
        )
        .into()
    })
}
