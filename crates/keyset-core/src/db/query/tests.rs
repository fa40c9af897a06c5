use super::*;
use crate::{
    Error,
    db::{KeySpace, Session},
    lookup,
    obs::sink::{MetricsEvent, PlanKind},
    test_support::{
        Author, Book, CaptureSink, NUMERIC_MODEL, NumericData, PERSON_MODEL, Person,
        memory_session,
    },
    value::{Id, Value},
};
use std::{ops::Bound, sync::Arc};

fn seed_numeric(session: &Session) {
    for pv in [-3.0, -1.0, 0.0, 2.0, 4.0] {
        session
            .save(&mut NumericData::new(pv))
            .expect("save should succeed");
    }
}

fn pvs(set: &QuerySet<NumericData>) -> Vec<f64> {
    let mut values: Vec<f64> = set
        .iter()
        .expect("query should run")
        .map(|item| item.pv)
        .collect();
    values.sort_by(f64::total_cmp);
    values
}

fn names(set: &QuerySet<Person>) -> Vec<String> {
    let mut names: Vec<String> = set
        .iter()
        .expect("query should run")
        .map(|p| p.name().to_string())
        .collect();
    names.sort();
    names
}

fn seed_people(session: &Session) -> Vec<Person> {
    let mut out = Vec::new();
    for (name, age, city) in [
        ("ann", 30, "rome"),
        ("bob", 40, "oslo"),
        ("cat", 30, "oslo"),
        ("dan", 55, "rome"),
    ] {
        let mut person = Person::new(name, age).in_city(city);
        session.save(&mut person).expect("save should succeed");
        out.push(person);
    }
    out
}

// ----------------------------------------------------------------------
// Compilation
// ----------------------------------------------------------------------

fn compile_err(model: &'static crate::model::entity::EntityModel, preds: &Predicates) -> QueryError {
    let keys = KeySpace::default();
    LookupCompiler::new(model, &keys)
        .compile(preds)
        .expect_err("compilation should fail")
}

#[test]
fn rejects_unknown_and_unindexed_fields() {
    assert!(matches!(
        compile_err(&PERSON_MODEL, &lookup! { nickname = "x" }),
        QueryError::UnknownField { .. }
    ));
    assert!(matches!(
        compile_err(&NUMERIC_MODEL, &lookup! { label = "x" }),
        QueryError::NotQueryable { .. }
    ));
    assert!(matches!(
        compile_err(&PERSON_MODEL, &lookup! { friends = "x" }),
        QueryError::NotQueryable { .. }
    ));
}

#[test]
fn rejects_unsupported_lookup_shapes() {
    assert!(matches!(
        compile_err(&NUMERIC_MODEL, &lookup! { pv__contains = 1 }),
        QueryError::UnsupportedLookup { .. }
    ));
    assert!(matches!(
        compile_err(&NUMERIC_MODEL, &lookup! { pv__gt__lt = 1 }),
        QueryError::UnsupportedLookup { .. }
    ));
    assert!(matches!(
        compile_err(&PERSON_MODEL, &lookup! { city__gt = "m" }),
        QueryError::NotOrdered { .. }
    ));
    assert!(matches!(
        compile_err(&PERSON_MODEL, &lookup! { id__gt = "m" }),
        QueryError::UnsupportedLookup { .. }
    ));
}

#[test]
fn rejects_malformed_values() {
    assert!(matches!(
        compile_err(&PERSON_MODEL, &lookup! { city = Value::Null }),
        QueryError::InvalidValue { .. }
    ));
    assert!(matches!(
        compile_err(&PERSON_MODEL, &lookup! { age__in = 3 }),
        QueryError::InvalidValue { .. }
    ));
    assert!(matches!(
        compile_err(&PERSON_MODEL, &lookup! { age = "old" }),
        QueryError::InvalidValue { .. }
    ));
}

#[test]
fn two_unique_predicates_are_a_compile_error() {
    let err = compile_err(&PERSON_MODEL, &lookup! { id = "1", name = "ann" });
    let QueryError::MultipleUniquePredicates { fields } = err else {
        panic!("expected MultipleUniquePredicates");
    };
    assert_eq!(fields, vec!["id".to_string(), "name".to_string()]);
}

#[test]
fn range_bounds_fold_into_one_clause_per_field() {
    let keys = KeySpace::default();
    let compiled = LookupCompiler::new(&NUMERIC_MODEL, &keys)
        .compile(&lookup! { pv__gt = 1, pv__ge = 2, pv__lt = 10, pv__le = 10 })
        .expect("compile should succeed");

    assert!(compiled.unique.is_none());
    assert_eq!(
        compiled.clauses,
        vec![FilterClause::Range {
            field: "pv",
            key: keys.range(&NUMERIC_MODEL, "pv"),
            min: Bound::Included(2.0),
            max: Bound::Excluded(10.0),
        }]
    );
}

#[test]
fn integer_ranges_accept_fractional_bounds() {
    let (session, _) = memory_session();
    seed_people(&session);
    let people = session.query::<Person>();

    assert_eq!(
        names(&people.filter(lookup! { age__gt = 39.5 })),
        vec!["bob", "dan"]
    );
    assert_eq!(
        names(&people.filter(lookup! { age__lt = 30.5, age__ge = 29.9 })),
        vec!["ann", "cat"]
    );

    let keys = KeySpace::default();
    let err = LookupCompiler::new(&PERSON_MODEL, &keys)
        .compile(&lookup! { age__gt = "old" })
        .expect_err("text bound should fail");
    assert!(matches!(err, QueryError::InvalidValue { .. }));
}

#[test]
fn unique_predicate_is_detected() {
    let keys = KeySpace::default();
    let compiled = LookupCompiler::new(&PERSON_MODEL, &keys)
        .compile(&lookup! { name = "ann", age = 30 })
        .expect("compile should succeed");

    assert_eq!(
        compiled.unique,
        Some(UniqueTarget::Field {
            field: "name",
            key: keys.unique(&PERSON_MODEL, "name", "ann"),
        })
    );
}

// ----------------------------------------------------------------------
// Execution
// ----------------------------------------------------------------------

#[test]
fn numeric_ranges_select_exact_values() {
    let (session, _) = memory_session();
    seed_numeric(&session);
    let data = session.query::<NumericData>();

    assert_eq!(pvs(&data.filter(lookup! { pv__gt = 1 })), vec![2.0, 4.0]);
    assert_eq!(
        pvs(&data.filter(lookup! { pv__ge = -2, pv__lt = 3 })),
        vec![-1.0, 0.0, 2.0]
    );
    assert_eq!(pvs(&data.filter(lookup! { pv__le = -3 })), vec![-3.0]);
    assert_eq!(pvs(&data.filter(lookup! { pv = 0 })), vec![0.0]);
    assert_eq!(data.filter(lookup! { pv__gt = 4 }).count().expect("count"), 0);
}

#[test]
fn unique_lookup_short_circuits_other_predicates() {
    let (session, _) = memory_session();
    seed_people(&session);

    let sink = Arc::new(CaptureSink::default());
    let session = session.metrics_sink(sink.clone());

    let set = session
        .query::<Person>()
        .filter(lookup! { name = "ann", age = 99 });
    assert_eq!(set.plan().expect("plan").kind(), PlanKind::Unique);
    assert_eq!(names(&set), vec!["ann"]);

    let plans: Vec<PlanKind> = sink
        .events()
        .into_iter()
        .filter_map(|event| match event {
            MetricsEvent::Plan { kind } => Some(kind),
            _ => None,
        })
        .collect();
    assert_eq!(plans, vec![PlanKind::Unique]);
}

#[test]
fn unique_lookup_still_honours_exclusions() {
    let (session, _) = memory_session();
    seed_people(&session);

    let set = session
        .query::<Person>()
        .filter(lookup! { name = "ann" })
        .exclude(lookup! { city = "rome" });
    assert_eq!(set.count().expect("count"), 0);

    let missing = session.query::<Person>().filter(lookup! { name = "zed" });
    assert!(!missing.exists().expect("exists"));
}

#[test]
fn conjunctions_intersect_and_exclusions_subtract() {
    let (session, _) = memory_session();
    seed_people(&session);
    let people = session.query::<Person>();

    assert_eq!(
        names(&people.filter(lookup! { age = 30, city = "oslo" })),
        vec!["cat"]
    );
    assert_eq!(
        names(&people.exclude(lookup! { city = "rome" })),
        vec!["bob", "cat"]
    );
    assert_eq!(
        names(&people.filter(lookup! { age__ge = 30 }).exclude(lookup! { age = 30 })),
        vec!["bob", "dan"]
    );
    assert_eq!(
        names(&people.filter(lookup! { age__in = [40, 55] })),
        vec!["bob", "dan"]
    );
    assert_eq!(
        names(&people.exclude(lookup! { age__lt = 50, city = "oslo" })),
        vec!["dan"]
    );
    assert_eq!(
        people
            .filter(lookup! { age__in = Vec::<i64>::new() })
            .count()
            .expect("count"),
        0
    );
}

#[test]
fn primary_key_lookups() {
    let (session, _) = memory_session();
    let seeded = seed_people(&session);
    let ann = seeded[0].id.clone().expect("saved");
    let bob = seeded[1].id.clone().expect("saved");
    let people = session.query::<Person>();

    let found = people.get(lookup! { id = ann.clone() }).expect("get by id");
    assert_eq!(found.name(), "ann");

    let set = people.filter(lookup! { id__in = vec![ann, bob, Id::from("nope")] });
    assert_eq!(names(&set), vec!["ann", "bob"]);

    let set = people.filter(lookup! { id = "nope" });
    assert_eq!(set.count().expect("count"), 0);
}

#[test]
fn get_requires_exactly_one_match() {
    let (session, _) = memory_session();
    seed_people(&session);
    let people = session.query::<Person>();

    let err = people.get(lookup! { age = 30 }).expect_err("two matches");
    assert!(matches!(err, Error::NonUnique { count: 2 }));

    let err = people.get(lookup! { age = 31 }).expect_err("no match");
    assert!(err.is_not_found());

    assert_eq!(people.get(lookup! { age = 40 }).expect("one match").name(), "bob");
}

#[test]
fn chained_filters_keep_existing_keys() {
    let (session, _) = memory_session();
    seed_people(&session);

    let set = session
        .query::<Person>()
        .filter(lookup! { age = 30 })
        .filter(lookup! { age = 40, city = "oslo" });
    assert_eq!(names(&set), vec!["cat"]);
}

#[test]
fn results_are_a_snapshot_of_first_evaluation() {
    let (session, _) = memory_session();
    seed_people(&session);

    let set = session.query::<Person>().filter(lookup! { age = 30 });
    assert_eq!(set.items().expect("items").len(), 2);

    session
        .save(&mut Person::new("eve", 30))
        .expect("save should succeed");
    assert_eq!(set.count().expect("count"), 2, "cached results are kept");
    assert_eq!(set.clone().count().expect("count"), 3, "clones re-evaluate");
}

#[test]
fn empty_set_never_touches_the_backend() {
    let (session, _) = memory_session();
    let set = session.query::<Person>().none();

    assert_eq!(set.plan().expect("plan").kind(), PlanKind::Empty);
    assert_eq!(set.count().expect("count"), 0);
    assert_eq!(set.to_string(), "person.none()");
}

#[test]
fn unrestricted_query_counts_the_all_set() {
    let (session, _) = memory_session();
    seed_people(&session);

    let all = session.query::<Person>().all();
    assert_eq!(all.plan().expect("plan").kind(), PlanKind::All);
    assert_eq!(all.count().expect("count"), 4);
    assert_eq!(session.query::<Person>().count().expect("count"), 4);
}

#[test]
fn compile_errors_surface_before_io() {
    let (session, store) = memory_session();
    let set = session.query::<Person>().filter(lookup! { nickname = "x" });

    assert!(matches!(set.prepare(), Err(Error::Query(_))));
    assert!(matches!(set.count(), Err(Error::Query(_))));
    assert_eq!(store.key_count(), 0);
}

#[test]
fn delete_removes_every_match() {
    let (session, _) = memory_session();
    seed_people(&session);

    let deleted = session
        .query::<Person>()
        .filter(lookup! { city = "rome" })
        .delete()
        .expect("delete should succeed");
    assert_eq!(deleted, 2);
    assert_eq!(names(&session.query::<Person>().all()), vec!["bob", "cat"]);
}

#[test]
fn select_related_loads_foreign_keys_in_one_pass() {
    let (session, _) = memory_session();
    let mut author = Author::new("ursula", "wrote about wizards");
    session.save(&mut author).expect("save author");
    for (title, year) in [("earthsea", 1968), ("tombs", 1970)] {
        session
            .save(&mut Book::new(title, year).by(&author))
            .expect("save book");
    }
    session
        .save(&mut Book::new("anonymous", 1900))
        .expect("save book");

    let books = session.query::<Book>().all().select_related("author");
    for book in books.iter().expect("books") {
        let authors: Vec<Author> = books
            .related(book, "author")
            .expect("related should load");
        if book.author.is_some() {
            assert_eq!(authors, vec![author.clone()]);
        } else {
            assert!(authors.is_empty());
        }
    }

    let err = books
        .related::<Person>(&books.items().expect("items")[0], "author")
        .expect_err("wrong target type");
    assert!(matches!(err, Error::Relation(_)));
}

#[test]
fn plan_display_and_fingerprint_are_stable() {
    let keys = KeySpace::new("t.");
    let a = QueryPlan::build(
        &NUMERIC_MODEL,
        &keys,
        &lookup! { pv__gt = 1 },
        &Predicates::new(),
        &[],
    )
    .expect("plan should build");
    let b = QueryPlan::build(
        &NUMERIC_MODEL,
        &keys,
        &lookup! { pv__gt = 1.0 },
        &Predicates::new(),
        &[],
    )
    .expect("plan should build");

    assert_eq!(a, b);
    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_eq!(a.fingerprint().len(), 16);
    assert!(a.to_string().starts_with("numeric +range(t.numeric:rng:pv"));
}
