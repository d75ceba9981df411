//! End-to-end tests driving the engine through its public API.

use latchdb::{
    Database, Error, FieldOp, IndexSpec, Key, KeySpec, QueryOutput, Registry, SchemaDescriptor,
    TableSpec, ValidationError,
};
use serde_json::json;

fn kanji_descriptor(name: &str) -> SchemaDescriptor {
    SchemaDescriptor::new(name, 1).table(
        "kanji",
        TableSpec::new(KeySpec::path("key"))
            .index(IndexSpec::new("order", "order").unique())
            .index(IndexSpec::new("level", "level")),
    )
}

async fn open_kanji(registry: &Registry, name: &str) -> Database {
    registry.open(kanji_descriptor(name)).await.unwrap()
}

async fn seed_kanji(db: &Database) {
    let kanji = db.table("kanji").unwrap();
    kanji
        .insert_many(vec![
            json!({"key": "ichi", "order": 0, "level": 1, "meaning": "one"}),
            json!({"key": "ni", "order": 1, "level": 1, "meaning": "two"}),
            json!({"key": "san", "order": 2, "level": 2, "meaning": "three"}),
        ])
        .unwrap()
        .await
        .unwrap();
}

#[tokio::test]
async fn second_open_of_a_live_handle_is_rejected() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "dup").await;
    let err = registry.open(kanji_descriptor("dup")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyOpen(_)));

    db.close();
    assert_eq!(registry.is_closed("dup"), Some(true));
    let db = open_kanji(&registry, "dup").await;
    assert_eq!(db.version(), 1);
}

#[tokio::test]
async fn insert_resolves_keys_in_input_order_and_count_adds_up() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "counting").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    let keys = kanji
        .insert_many(vec![
            json!({"key": "go", "order": 4, "level": 3}),
            json!({"key": "yon", "order": 3, "level": 2}),
        ])
        .unwrap()
        .await
        .unwrap();
    assert_eq!(keys, vec![Key::from("go"), Key::from("yon")]);

    kanji.remove("ichi").unwrap().await.unwrap();
    let count = kanji.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(4));
}

#[tokio::test]
async fn query_bound_conflicts_fail_at_the_offending_call() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "bounds").await;
    let kanji = db.table("kanji").unwrap();

    let err = kanji
        .query()
        .equals("a")
        .unwrap()
        .lower_bound("b", false)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::EqualsWithBounds)
    ));

    let err = kanji
        .query()
        .lower_bound("a", false)
        .unwrap()
        .equals("b")
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::EqualsWithBounds)
    ));

    let err = kanji
        .query()
        .lower_bound("a", false)
        .unwrap()
        .lower_bound("b", false)
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::BoundAlreadySet { which: "lower" })
    ));

    let err = kanji.query().desc().unwrap().count().err().unwrap();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::CountConflict)
    ));

    let err = kanji.query().count().unwrap().first(3).err().unwrap();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::ConflictsWithCount { option: "first" })
    ));

    let err = kanji.query().keyvalue().unwrap().go().unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::KeyValueNeedsIndex)
    ));
}

#[tokio::test]
async fn first_caps_the_hit_count() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "caps").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    let records = kanji
        .query()
        .index("order")
        .first(2)
        .unwrap()
        .go()
        .unwrap()
        .await
        .unwrap()
        .records()
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["key"], json!("ichi"));
    assert_eq!(records[1]["key"], json!("ni"));
}

#[tokio::test]
async fn distinct_yields_one_hit_per_index_key() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "distinct").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    let pairs = kanji
        .query()
        .index("level")
        .distinct()
        .unwrap()
        .keyvalue()
        .unwrap()
        .go()
        .unwrap()
        .await
        .unwrap()
        .pairs()
        .unwrap();
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0].index, Key::from(1));
    assert_eq!(pairs[0].primary, Key::from("ichi"));
    assert_eq!(pairs[1].index, Key::from(2));
    assert_eq!(pairs[1].primary, Key::from("san"));
}

#[tokio::test]
async fn keysonly_projects_primary_keys_in_index_order() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "keysonly").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    let keys = kanji
        .query()
        .index("order")
        .desc()
        .unwrap()
        .keysonly()
        .unwrap()
        .go()
        .unwrap()
        .await
        .unwrap()
        .keys()
        .unwrap();
    assert_eq!(
        keys,
        vec![Key::from("san"), Key::from("ni"), Key::from("ichi")]
    );
}

#[tokio::test]
async fn constant_derivation_matches_literal_bulk_update() {
    let registry = Registry::new();
    let lit_db = open_kanji(&registry, "bulk-lit").await;
    let der_db = open_kanji(&registry, "bulk-der").await;
    seed_kanji(&lit_db).await;
    seed_kanji(&der_db).await;

    let lit = lit_db.table("kanji").unwrap();
    let der = der_db.table("kanji").unwrap();
    let lit_keys = lit
        .bulk_update()
        .set("reviewed", true)
        .go()
        .unwrap()
        .await
        .unwrap();
    let der_keys = der
        .bulk_update()
        .set_from("reviewed", |_| json!(true))
        .go()
        .unwrap()
        .await
        .unwrap();
    assert_eq!(lit_keys, der_keys);

    let lit_records = lit.query().go().unwrap().await.unwrap().records().unwrap();
    let der_records = der.query().go().unwrap().await.unwrap().records().unwrap();
    assert_eq!(lit_records, der_records);
}

#[tokio::test]
async fn bulk_update_derivations_see_earlier_sets() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "derive").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    kanji
        .bulk_update()
        .set("level", 10)
        .set_from("next_level", |r| json!(r.number("level").unwrap_or(0.0) + 1.0))
        .del("meaning")
        .go()
        .unwrap()
        .await
        .unwrap();

    let records = kanji.query().go().unwrap().await.unwrap().records().unwrap();
    for record in records {
        assert_eq!(record["level"], json!(10));
        assert_eq!(record["next_level"], json!(11.0));
        assert!(record.get("meaning").is_none());
    }
}

#[tokio::test]
async fn bulk_update_without_mutation_fails_synchronously() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "no-mutation").await;
    let kanji = db.table("kanji").unwrap();
    let err = kanji.bulk_update().equals("ichi").go().unwrap_err();
    assert!(matches!(err, Error::MissingMutation));
}

#[tokio::test]
async fn later_bound_calls_replace_earlier_ones_on_bulk_builders() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "rebound").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    // The lower bound would match everything from "ni" up; the later
    // equals replaces it wholesale.
    let written = kanji
        .bulk_update()
        .lower_bound("ni", false)
        .equals("ichi")
        .set("flag", 1)
        .go()
        .unwrap()
        .await
        .unwrap();
    assert_eq!(written, vec![Key::from("ichi")]);
}

#[tokio::test]
async fn del_if_removes_fields_only_where_the_predicate_matches() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "del-if").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    kanji
        .bulk_update()
        .set_op("reviewed", FieldOp::Literal(json!(true)))
        .del_if("meaning", |r| r.number("level") == Some(1.0))
        .go()
        .unwrap()
        .await
        .unwrap();

    let records = kanji.query().go().unwrap().await.unwrap().records().unwrap();
    for record in records {
        assert_eq!(record["reviewed"], json!(true));
        match record["key"].as_str().unwrap() {
            "san" => assert_eq!(record["meaning"], json!("three")),
            _ => assert!(record.get("meaning").is_none()),
        }
    }
}

#[tokio::test]
async fn bounds_sets_both_endpoints_in_one_call() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "both-bounds").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    // Open lower endpoint excludes order 0, closed upper keeps order 2.
    let deleted = kanji
        .bulk_delete()
        .index("order")
        .bounds(0, 2, true, false)
        .go()
        .unwrap()
        .await
        .unwrap();
    assert_eq!(deleted, vec![Key::from("ni"), Key::from("san")]);

    let count = kanji.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(1));
}

#[tokio::test]
async fn bulk_delete_filter_narrows_the_range() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "sweep").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    let deleted = kanji
        .bulk_delete()
        .index("level")
        .equals(1)
        .filter(|r| r.str("meaning") == Some("two"))
        .go()
        .unwrap()
        .await
        .unwrap();
    assert_eq!(deleted, vec![Key::from("ni")]);

    let count = kanji.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(2));
}

#[tokio::test]
async fn failed_transaction_leaves_every_table_unchanged() {
    let registry = Registry::new();
    let db = registry
        .open(
            kanji_descriptor("txn-abort")
                .table("notes", TableSpec::new(KeySpec::path("id"))),
        )
        .await
        .unwrap();
    seed_kanji(&db).await;

    let mut txn = db.transaction().unwrap();
    txn.insert("notes", json!({"id": 1, "text": "hi"})).unwrap();
    // Duplicate primary key: the whole commit must abort.
    txn.insert("kanji", json!({"key": "ichi", "order": 9})).unwrap();
    let err = txn.commit().unwrap().await.unwrap_err();
    assert!(matches!(err, Error::Store(_)));

    let notes = db.table("notes").unwrap();
    let count = notes.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(0));
    let kanji = db.table("kanji").unwrap();
    let count = kanji.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(3));
}

#[tokio::test]
async fn committed_transaction_reports_keys_per_table() {
    let registry = Registry::new();
    let db = registry
        .open(
            kanji_descriptor("txn-report")
                .table("notes", TableSpec::new(KeySpec::path("id"))),
        )
        .await
        .unwrap();
    seed_kanji(&db).await;

    let mut txn = db.transaction().unwrap();
    txn.insert("notes", json!({"id": 1, "text": "hi"})).unwrap();
    txn.update("kanji", json!({"key": "ichi", "order": 0, "level": 5}))
        .unwrap();
    txn.remove("kanji", "ni").unwrap();
    assert_eq!(txn.len(), 3);
    let report = txn.commit().unwrap().await.unwrap();

    assert_eq!(report.tables["notes"].insert, vec![Key::from(1)]);
    assert_eq!(report.tables["kanji"].update, vec![Key::from("ichi")]);
    assert_eq!(report.tables["kanji"].remove, vec![Key::from("ni")]);

    let kanji = db.table("kanji").unwrap();
    let count = kanji.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(2));
}

#[tokio::test]
async fn transaction_without_commit_has_no_effect() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "txn-unused").await;
    seed_kanji(&db).await;

    {
        let mut txn = db.transaction().unwrap();
        txn.insert("kanji", json!({"key": "yon", "order": 3})).unwrap();
        txn.remove("kanji", "ichi").unwrap();
        // Dropped without commit.
    }

    let kanji = db.table("kanji").unwrap();
    let count = kanji.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(3));
}

#[tokio::test]
async fn empty_transaction_commits_to_an_empty_report() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "txn-empty").await;
    let txn = db.transaction().unwrap();
    assert!(txn.is_empty());
    let report = txn.commit().unwrap().await.unwrap();
    assert!(report.tables.is_empty());
}

#[tokio::test]
async fn transaction_rejects_unknown_tables() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "txn-unknown").await;
    let mut txn = db.transaction().unwrap();
    let err = txn.insert("ghost", json!({"key": "a"})).unwrap_err();
    assert!(matches!(err, Error::UnknownTable { .. }));
}

#[tokio::test]
async fn kanji_lookup_count_and_reverse_order() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "kanji-app").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    let hit = kanji
        .query()
        .index("order")
        .equals(1)
        .unwrap()
        .go()
        .unwrap()
        .await
        .unwrap()
        .records()
        .unwrap();
    assert_eq!(hit.len(), 1);
    assert_eq!(hit[0]["key"], json!("ni"));

    let count = kanji.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(3));

    let records = kanji
        .query()
        .index("order")
        .desc()
        .unwrap()
        .go()
        .unwrap()
        .await
        .unwrap()
        .records()
        .unwrap();
    let orders: Vec<i64> = records.iter().map(|r| r["order"].as_i64().unwrap()).collect();
    assert_eq!(orders, vec![2, 1, 0]);
}

#[tokio::test]
async fn query_admitted_behind_a_pending_write_observes_it() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "isolation").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    // Issue the update and query it back before awaiting the write.
    let write = kanji
        .update(json!({"key": "ichi", "order": 0, "level": 1, "meaning": "ONE"}))
        .unwrap();
    let records = kanji
        .query()
        .equals("ichi")
        .unwrap()
        .go()
        .unwrap()
        .await
        .unwrap()
        .records()
        .unwrap();
    assert_eq!(records[0]["meaning"], json!("ONE"));
    write.await.unwrap();
}

#[tokio::test]
async fn abandoned_write_still_applies_and_releases_its_guard() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "abandon").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    drop(kanji.remove("ichi").unwrap());
    // A later awaited write drains the queue past the abandoned one.
    kanji.remove("zzz").unwrap().await.unwrap();
    let count = kanji.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(2));
}

#[tokio::test]
async fn failed_write_releases_its_admission_hold() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "failed-write").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    let err = kanji
        .insert(json!({"key": "ichi", "order": 9}))
        .unwrap()
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store(_)));

    // With the failure collected nothing is pending any more, so queries
    // read committed state directly and see the store untouched.
    let count = kanji.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(3));
    let pending = kanji.query().equals("ichi").unwrap().go().unwrap();
    let records = pending.await.unwrap().records().unwrap();
    assert_eq!(records[0]["order"], json!(0));
}

#[tokio::test]
async fn closed_handle_rejects_every_operation() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "closing").await;
    let kanji = db.table("kanji").unwrap();
    db.close();
    db.close(); // idempotent

    assert!(matches!(
        kanji.insert(json!({"key": "a", "order": 0})).unwrap_err(),
        Error::Closed(_)
    ));
    assert!(matches!(kanji.query().go().unwrap_err(), Error::Closed(_)));
    assert!(matches!(
        kanji.bulk_update().set("x", 1).go().unwrap_err(),
        Error::Closed(_)
    ));
    assert!(matches!(kanji.truncate().unwrap_err(), Error::Closed(_)));
    assert!(matches!(db.transaction().unwrap_err(), Error::Closed(_)));
}

#[tokio::test]
async fn drop_requires_close_and_destroys_the_store() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "dropping").await;
    seed_kanji(&db).await;

    let err = db.clone().drop().unwrap_err();
    assert!(matches!(err, Error::NotClosed(_)));

    db.close();
    db.drop().unwrap();
    assert_eq!(registry.is_closed("dropping"), None);

    // Reopening starts from an empty store at the declared version.
    let db = open_kanji(&registry, "dropping").await;
    let kanji = db.table("kanji").unwrap();
    let count = kanji.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(0));
}

#[tokio::test]
async fn close_preserves_data_for_reopen() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "persist").await;
    seed_kanji(&db).await;
    db.close();

    let db = open_kanji(&registry, "persist").await;
    let kanji = db.table("kanji").unwrap();
    let count = kanji.query().count().unwrap().go().unwrap().await.unwrap();
    assert_eq!(count, QueryOutput::Count(3));
}

#[tokio::test]
async fn upgrade_creates_tables_and_backfills_indexes() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "upgrading").await;
    seed_kanji(&db).await;
    db.close();

    let db = registry
        .open(
            SchemaDescriptor::new("upgrading", 2)
                .table(
                    "kanji",
                    TableSpec::new(KeySpec::path("key"))
                        .index(IndexSpec::new("meaning", "meaning"))
                        .drop_index("level"),
                )
                .table("notes", TableSpec::new(KeySpec::path("id"))),
        )
        .await
        .unwrap();
    assert_eq!(db.version(), 2);
    assert_eq!(db.table_names(), vec!["kanji".to_string(), "notes".to_string()]);

    let kanji = db.table("kanji").unwrap();
    let records = kanji
        .query()
        .index("meaning")
        .equals("two")
        .unwrap()
        .go()
        .unwrap()
        .await
        .unwrap()
        .records()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["key"], json!("ni"));
    assert!(matches!(
        kanji.query().index("level").go().unwrap().await.unwrap_err(),
        Error::Store(_)
    ));
}

#[tokio::test]
async fn reopening_below_the_current_version_is_a_configuration_error() {
    let registry = Registry::new();
    let db = registry
        .open(SchemaDescriptor::new("versions", 3).table(
            "kanji",
            TableSpec::new(KeySpec::path("key")),
        ))
        .await
        .unwrap();
    db.close();

    let err = registry
        .open(SchemaDescriptor::new("versions", 2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn invalid_descriptors_are_rejected() {
    let registry = Registry::new();
    assert!(matches!(
        registry.open(SchemaDescriptor::new("", 1)).await.unwrap_err(),
        Error::Configuration(_)
    ));
    assert!(matches!(
        registry.open(SchemaDescriptor::new("zero", 0)).await.unwrap_err(),
        Error::Configuration(_)
    ));
    assert!(matches!(
        registry
            .open(SchemaDescriptor::new("keyless", 1).table(
                "t",
                TableSpec::new(KeySpec::default()),
            ))
            .await
            .unwrap_err(),
        Error::Configuration(_)
    ));
}

#[tokio::test]
async fn auto_increment_assigns_and_injects_keys() {
    let registry = Registry::new();
    let db = registry
        .open(SchemaDescriptor::new("auto", 1).table(
            "log",
            TableSpec::new(KeySpec::path_auto("id")),
        ))
        .await
        .unwrap();
    let log = db.table("log").unwrap();

    let keys = log
        .insert_many(vec![json!({"msg": "a"}), json!({"msg": "b"})])
        .unwrap()
        .await
        .unwrap();
    assert_eq!(keys, vec![Key::from(1), Key::from(2)]);

    log.truncate().unwrap().await.unwrap();
    // The generator survives truncation.
    let keys = log.insert(json!({"msg": "c"})).unwrap().await.unwrap();
    assert_eq!(keys, vec![Key::from(3)]);
    let records = log.query().go().unwrap().await.unwrap().records().unwrap();
    assert_eq!(records[0]["id"], json!(3.0));
}

#[tokio::test]
async fn record_validation_fails_before_admission() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "validation").await;
    let kanji = db.table("kanji").unwrap();

    assert!(matches!(
        kanji.insert(json!("not an object")).unwrap_err(),
        Error::Validation(ValidationError::NotAnObject)
    ));
    assert!(matches!(
        kanji.insert(json!({"order": 1})).unwrap_err(),
        Error::Validation(ValidationError::MissingKeyField { .. })
    ));
    assert!(matches!(
        kanji.insert(json!({"key": true})).unwrap_err(),
        Error::Validation(ValidationError::InvalidKey(_))
    ));
}

#[tokio::test]
async fn wait_resolves_all_or_fails_on_the_first_failure() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "waiting").await;
    let kanji = db.table("kanji").unwrap();

    let results = registry
        .wait(vec![
            kanji.insert(json!({"key": "a", "order": 0})).unwrap(),
            kanji.insert(json!({"key": "b", "order": 1})).unwrap(),
        ])
        .await
        .unwrap();
    assert_eq!(results, vec![vec![Key::from("a")], vec![Key::from("b")]]);

    let err = registry
        .wait(vec![
            kanji.insert(json!({"key": "c", "order": 2})).unwrap(),
            kanji.insert(json!({"key": "a", "order": 3})).unwrap(),
        ])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Store(_)));
}

#[tokio::test]
async fn range_queries_honor_open_and_closed_bounds() {
    let registry = Registry::new();
    let db = open_kanji(&registry, "ranges").await;
    seed_kanji(&db).await;
    let kanji = db.table("kanji").unwrap();

    let keys = kanji
        .query()
        .index("order")
        .lower_bound(0, true)
        .unwrap()
        .upper_bound(2, false)
        .unwrap()
        .keysonly()
        .unwrap()
        .go()
        .unwrap()
        .await
        .unwrap()
        .keys()
        .unwrap();
    assert_eq!(keys, vec![Key::from("ni"), Key::from("san")]);

    let filtered = kanji
        .query()
        .filter(|record| record["level"] == json!(1))
        .unwrap()
        .go()
        .unwrap()
        .await
        .unwrap()
        .records()
        .unwrap();
    assert_eq!(filtered.len(), 2);
}
