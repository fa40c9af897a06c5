//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use keyset_core::{
    Error,
    db::{MemoryStore, Session},
    model::{
        entity::EntityModel,
        field::{FieldModel, ScalarKind},
    },
    traits::EntityKind,
    value::{Id, Row, Value},
};
use std::sync::Arc;

static ITEM_FIELDS: [FieldModel; 4] = [
    FieldModel::scalar("sku", ScalarKind::Str).unique(),
    FieldModel::scalar("price", ScalarKind::Float).indexed(),
    FieldModel::scalar("qty", ScalarKind::Int).indexed(),
    FieldModel::many_to_many("peers", &ITEM_MODEL, "peers"),
];
pub static ITEM_MODEL: EntityModel = EntityModel::new("it::Item", "item", &ITEM_FIELDS);

///
/// Item
///

#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub id: Option<Id>,
    pub sku: Option<String>,
    pub price: f64,
    pub qty: i64,
}

impl Item {
    pub fn new(sku: &str, price: f64) -> Self {
        Self {
            id: None,
            sku: Some(sku.to_string()),
            price,
            qty: 0,
        }
    }

    pub const fn priced(price: f64) -> Self {
        Self {
            id: None,
            sku: None,
            price,
            qty: 0,
        }
    }

    pub const fn qty(mut self, qty: i64) -> Self {
        self.qty = qty;
        self
    }
}

impl EntityKind for Item {
    const MODEL: &'static EntityModel = &ITEM_MODEL;

    fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: Id) {
        self.id = Some(id);
    }

    fn to_row(&self) -> Row {
        Row::from([
            ("sku".to_string(), Value::from(self.sku.clone())),
            ("price".to_string(), Value::from(self.price)),
            ("qty".to_string(), Value::from(self.qty)),
        ])
    }

    fn from_row(id: Id, row: Row) -> Result<Self, Error> {
        Ok(Self {
            id: Some(id),
            sku: row.get("sku").and_then(Value::as_text).map(str::to_string),
            price: row.get("price").and_then(Value::as_float).unwrap_or_default(),
            qty: row.get("qty").and_then(Value::as_int).unwrap_or_default(),
        })
    }
}

pub fn session() -> (Session, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (Session::new(store.clone()), store)
}

pub fn prices(items: &[Item]) -> Vec<f64> {
    let mut prices: Vec<f64> = items.iter().map(|item| item.price).collect();
    prices.sort_by(f64::total_cmp);
    prices
}
