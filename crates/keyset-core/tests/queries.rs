mod common;

use common::{ITEM_MODEL, Item, prices, session};
use keyset_core::{
    Error,
    db::{Backend, MemoryStore, QueryError, Session},
    lookup,
    value::Value,
};
use proptest::{prelude::*, sample::Index};
use std::{collections::BTreeSet, ops::Bound};

#[test]
fn float_ranges_use_the_sorted_index() {
    let (session, _) = session();
    for price in [-3.0, -1.0, 0.0, 2.0, 4.0] {
        session
            .save(&mut Item::priced(price))
            .expect("save should succeed");
    }
    let items = session.query::<Item>();

    let above = items.filter(lookup! { price__gt = 1 });
    assert_eq!(prices(above.items().expect("query")), vec![2.0, 4.0]);

    let window = items.filter(lookup! { price__gt = -2, price__le = 2 });
    assert_eq!(prices(window.items().expect("query")), vec![-1.0, 0.0, 2.0]);

    let listed = items.filter(lookup! { price__in = [0.0, 4.0, 9.0] });
    assert_eq!(prices(listed.items().expect("query")), vec![0.0, 4.0]);
}

#[test]
fn unique_lookup_ignores_other_positive_predicates() {
    let (session, _) = session();
    session
        .save(&mut Item::new("a-1", 5.0).qty(3))
        .expect("save should succeed");
    session
        .save(&mut Item::new("a-2", 5.0).qty(4))
        .expect("save should succeed");
    let items = session.query::<Item>();

    let found = items
        .get(lookup! { sku = "a-1", qty = 99 })
        .expect("unique lookup should resolve");
    assert_eq!(found.qty, 3);

    let excluded = items
        .filter(lookup! { sku = "a-1" })
        .exclude(lookup! { qty = 3 });
    assert_eq!(excluded.count().expect("count"), 0);
}

#[test]
fn bad_predicates_fail_before_any_read() {
    let (session, _) = session();
    let err = session
        .query::<Item>()
        .filter(lookup! { price__near = 1 })
        .count()
        .expect_err("unknown lookup should fail");

    assert!(matches!(err, Error::Query(QueryError::UnsupportedLookup { .. })));
}

#[test]
fn deleted_instances_leave_no_keys() {
    let (session, store) = session();
    let mut item = Item::new("gone", 1.5).qty(2);
    session.save(&mut item).expect("save should succeed");
    let mut other = Item::new("kept", 2.5);
    session.save(&mut other).expect("save should succeed");
    session
        .many_to_many::<Item, _>(&item, "peers")
        .expect("manager")
        .add(&other)
        .expect("link");

    let before = store.key_count();
    assert!(session.delete(&item).expect("delete should succeed"));

    let id = item.id.clone().expect("saved");
    let leftovers: Vec<String> = store
        .keys_with_prefix(session.keys().prefix())
        .into_iter()
        .filter(|key| key.contains(id.as_str()) || key.contains("gone"))
        .collect();
    assert!(leftovers.is_empty(), "stale keys: {leftovers:?}");
    assert!(store.key_count() < before);
    assert!(
        !session
            .many_to_many::<Item, _>(&other, "peers")
            .expect("manager")
            .all()
            .exists()
            .expect("exists")
    );
}

///
/// Step
///
/// One write in a generated history. Slots pick a live item by position.
///

#[derive(Clone, Debug)]
enum Step {
    Create { sku: Option<u8>, qty: i64 },
    Update { slot: Index, sku: Option<u8>, qty: i64 },
    Delete { slot: Index },
}

const SKUS: u8 = 4;

fn sku_name(sku: u8) -> String {
    format!("sku-{sku}")
}

fn step() -> impl Strategy<Value = Step> {
    let sku = prop::option::of(0..SKUS);
    prop_oneof![
        (sku.clone(), -6_i64..6).prop_map(|(sku, qty)| Step::Create { sku, qty }),
        (any::<Index>(), sku, -6_i64..6).prop_map(|(slot, sku, qty)| Step::Update {
            slot,
            sku,
            qty
        }),
        any::<Index>().prop_map(|slot| Step::Delete { slot }),
    ]
}

fn ids<'a>(items: impl Iterator<Item = &'a Item>) -> BTreeSet<String> {
    items
        .map(|item| item.id.as_ref().expect("live items are saved").as_str().to_string())
        .collect()
}

// Every index structure must describe exactly the live items.
fn check_indexes(
    session: &Session,
    store: &MemoryStore,
    live: &[Item],
) -> Result<(), TestCaseError> {
    let keys = session.keys();
    let everyone = ids(live.iter());

    prop_assert_eq!(
        store.members(&keys.all(&ITEM_MODEL)).expect("members"),
        everyone.clone()
    );
    prop_assert_eq!(
        store
            .range_by_score(&keys.range(&ITEM_MODEL, "qty"), Bound::Unbounded, Bound::Unbounded)
            .expect("range"),
        everyone
    );
    for item in live {
        let id = item.id.as_ref().expect("saved");
        prop_assert_eq!(
            store
                .score(&keys.range(&ITEM_MODEL, "qty"), id.as_str())
                .expect("score"),
            Some(item.qty as f64)
        );
    }

    for qty in -6_i64..6 {
        let token = Value::from(qty).index_token().expect("ints have tokens");
        prop_assert_eq!(
            store
                .members(&keys.index(&ITEM_MODEL, "qty", &token))
                .expect("members"),
            ids(live.iter().filter(|item| item.qty == qty)),
            "qty {}",
            qty
        );
    }

    for sku in (0..SKUS).map(sku_name) {
        let token = Value::from(sku.as_str())
            .index_token()
            .expect("text has tokens");
        let holder = live
            .iter()
            .find(|item| item.sku.as_deref() == Some(sku.as_str()))
            .and_then(|item| item.id.as_ref())
            .map(|id| id.as_str().as_bytes().to_vec());
        prop_assert_eq!(
            store
                .get(&keys.unique(&ITEM_MODEL, "sku", &token))
                .expect("get"),
            holder,
            "{}",
            sku
        );
    }

    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn indexes_track_every_write(
        steps in prop::collection::vec(step(), 0..32),
        pivot in -8_i64..8,
    ) {
        let (session, store) = session();
        let mut live: Vec<Item> = Vec::new();

        for step in steps {
            match step {
                Step::Create { sku, qty } => {
                    let mut item = Item::priced(0.0).qty(qty);
                    item.sku = sku.map(sku_name);
                    let taken = item.sku.is_some()
                        && live.iter().any(|other| other.sku == item.sku);
                    match session.save(&mut item) {
                        Ok(_) => {
                            prop_assert!(!taken);
                            live.push(item);
                        }
                        Err(err) => prop_assert!(
                            taken && matches!(err, Error::UniqueViolation(_)),
                            "unexpected failure: {}",
                            err
                        ),
                    }
                }
                Step::Update { slot, sku, qty } => {
                    if live.is_empty() {
                        continue;
                    }
                    let at = slot.index(live.len());
                    let mut item = live[at].clone();
                    item.sku = sku.map(sku_name);
                    item.qty = qty;
                    let taken = item.sku.is_some()
                        && live
                            .iter()
                            .enumerate()
                            .any(|(i, other)| i != at && other.sku == item.sku);
                    match session.save(&mut item) {
                        Ok(_) => {
                            prop_assert!(!taken);
                            live[at] = item;
                        }
                        Err(err) => prop_assert!(
                            taken && matches!(err, Error::UniqueViolation(_)),
                            "unexpected failure: {}",
                            err
                        ),
                    }
                }
                Step::Delete { slot } => {
                    if live.is_empty() {
                        continue;
                    }
                    let item = live.remove(slot.index(live.len()));
                    prop_assert!(session.delete(&item).expect("delete should succeed"));
                }
            }

            check_indexes(&session, &store, &live)?;
        }

        let items = session.query::<Item>();
        let scan = |pred: &dyn Fn(i64) -> bool| live.iter().filter(|i| pred(i.qty)).count();

        prop_assert_eq!(
            items.filter(lookup! { qty__gt = pivot }).count().expect("count"),
            scan(&|q| q > pivot)
        );
        prop_assert_eq!(
            items.filter(lookup! { qty__le = pivot }).count().expect("count"),
            scan(&|q| q <= pivot)
        );
        prop_assert_eq!(
            items.filter(lookup! { qty = pivot }).count().expect("count"),
            scan(&|q| q == pivot)
        );
        prop_assert_eq!(
            items.exclude(lookup! { qty = pivot }).count().expect("count"),
            scan(&|q| q != pivot)
        );
    }
}
