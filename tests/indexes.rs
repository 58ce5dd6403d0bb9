//! Kind-specific index maintenance through the save path.

use assert_matches::assert_matches;

use recorddb::{
    Error, IndexDescriptor, IndexKind, Schema, Subspace, Tuple, TupleElement, Version,
};

mod common;
use common::{container, order_entity, user_entity, MemoryDb, User};

fn aggregate_schema() -> Schema {
    Schema::new(
        Version::new(1, 0, 0),
        vec![
            user_entity(vec![
                IndexDescriptor::new("idx_email_count", "User", vec!["email"], IndexKind::Count),
                IndexDescriptor::new(
                    "idx_score_sum",
                    "User",
                    vec!["email", "score"],
                    IndexKind::Sum,
                ),
                IndexDescriptor::new("idx_score_max", "User", vec!["score"], IndexKind::Max),
                IndexDescriptor::new("idx_score_min", "User", vec!["score"], IndexKind::Min),
                IndexDescriptor::new(
                    "idx_versions",
                    "User",
                    Vec::<String>::new(),
                    IndexKind::Version,
                ),
            ]),
            order_entity(Vec::new()),
        ],
    )
    .unwrap()
}

fn read_i64(db: &MemoryDb, key: &[u8]) -> Option<i64> {
    db.read(key)
        .map(|raw| i64::from_le_bytes(raw[..8].try_into().unwrap()))
}

fn group_key(sub: &Subspace, email: Option<&str>) -> Vec<u8> {
    match email {
        Some(email) => sub.pack(&Tuple::from_element(email)),
        None => sub.pack(&Tuple::new()),
    }
}

fn user(id: &str, email: &str, score: i64) -> User {
    let mut user = User::new(id, email);
    user.score = score;
    user
}

#[tokio::test]
async fn count_and_sum_track_groups_through_inserts_updates_and_deletes() {
    let db = MemoryDb::new();
    let container = container(&db, aggregate_schema(), None).await;
    container.migrate_if_needed().await.unwrap();
    let ctx = container.main_context();

    ctx.insert(&user("a", "x@x", 3)).unwrap();
    ctx.insert(&user("b", "x@x", 4)).unwrap();
    ctx.insert(&user("c", "y@y", 10)).unwrap();
    ctx.save().await.unwrap();

    let count_sub = container.keyspace().index_subspace("idx_email_count");
    let sum_sub = container.keyspace().index_subspace("idx_score_sum");
    assert_eq!(read_i64(&db, &group_key(&count_sub, Some("x@x"))), Some(2));
    assert_eq!(read_i64(&db, &group_key(&count_sub, Some("y@y"))), Some(1));
    assert_eq!(read_i64(&db, &group_key(&sum_sub, Some("x@x"))), Some(7));
    assert_eq!(read_i64(&db, &group_key(&sum_sub, Some("y@y"))), Some(10));

    // An update within the same group adjusts the sum, not the count.
    ctx.insert(&user("a", "x@x", 5)).unwrap();
    ctx.save().await.unwrap();
    assert_eq!(read_i64(&db, &group_key(&count_sub, Some("x@x"))), Some(2));
    assert_eq!(read_i64(&db, &group_key(&sum_sub, Some("x@x"))), Some(9));

    // An update that moves groups adjusts both sides.
    ctx.insert(&user("b", "y@y", 4)).unwrap();
    ctx.save().await.unwrap();
    assert_eq!(read_i64(&db, &group_key(&count_sub, Some("x@x"))), Some(1));
    assert_eq!(read_i64(&db, &group_key(&count_sub, Some("y@y"))), Some(2));
    assert_eq!(read_i64(&db, &group_key(&sum_sub, Some("x@x"))), Some(5));
    assert_eq!(read_i64(&db, &group_key(&sum_sub, Some("y@y"))), Some(14));

    // Deletes subtract.
    ctx.delete(&user("c", "y@y", 10)).unwrap();
    ctx.save().await.unwrap();
    assert_eq!(read_i64(&db, &group_key(&count_sub, Some("y@y"))), Some(1));
    assert_eq!(read_i64(&db, &group_key(&sum_sub, Some("y@y"))), Some(4));
}

#[tokio::test]
async fn min_and_max_only_ever_widen() {
    let db = MemoryDb::new();
    let container = container(&db, aggregate_schema(), None).await;
    container.migrate_if_needed().await.unwrap();
    let ctx = container.main_context();

    ctx.insert(&user("a", "x@x", 5)).unwrap();
    ctx.insert(&user("b", "y@y", 9)).unwrap();
    ctx.save().await.unwrap();

    let min_key = group_key(&container.keyspace().index_subspace("idx_score_min"), None);
    let max_key = group_key(&container.keyspace().index_subspace("idx_score_max"), None);
    assert_eq!(read_i64(&db, &min_key), Some(5));
    assert_eq!(read_i64(&db, &max_key), Some(9));

    // Removing the current extreme keeps the watermark.
    ctx.delete(&user("b", "y@y", 9)).unwrap();
    ctx.save().await.unwrap();
    assert_eq!(read_i64(&db, &max_key), Some(9));

    ctx.insert(&user("c", "z@z", 2)).unwrap();
    ctx.save().await.unwrap();
    assert_eq!(read_i64(&db, &min_key), Some(2));
}

#[tokio::test]
async fn negative_values_are_rejected_by_extremes() {
    let db = MemoryDb::new();
    let container = container(&db, aggregate_schema(), None).await;
    container.migrate_if_needed().await.unwrap();
    let ctx = container.main_context();

    ctx.insert(&user("a", "x@x", -1)).unwrap();
    assert_matches!(ctx.save().await, Err(Error::InvalidArgument(_)));
}

#[tokio::test]
async fn version_index_stamps_and_unstamps_records() {
    let db = MemoryDb::new();
    let container = container(&db, aggregate_schema(), None).await;
    container.migrate_if_needed().await.unwrap();
    let ctx = container.main_context();

    ctx.insert(&user("a", "x@x", 1)).unwrap();
    ctx.save().await.unwrap();

    let sub = container.keyspace().index_subspace("idx_versions");
    let companion_key = sub.pack(&Tuple::from_elements(vec![
        TupleElement::String("_v".into()),
        TupleElement::String("a".into()),
    ]));
    let stamp_one = db.read(&companion_key).expect("companion entry");
    assert_eq!(stamp_one.len(), 12);
    // Forward entry plus companion entry.
    assert_eq!(db.count_prefix(sub.prefix()), 2);

    // An update re-stamps: the companion changes, the old forward entry is
    // replaced, the entry count stays at two.
    ctx.insert(&user("a", "x@x", 2)).unwrap();
    ctx.save().await.unwrap();
    let stamp_two = db.read(&companion_key).expect("companion entry");
    assert_ne!(stamp_one, stamp_two);
    assert_eq!(db.count_prefix(sub.prefix()), 2);

    // A delete clears both entries.
    ctx.delete(&user("a", "x@x", 2)).unwrap();
    ctx.save().await.unwrap();
    assert_eq!(db.count_prefix(sub.prefix()), 0);
}

#[tokio::test]
async fn disabled_indexes_are_not_maintained() {
    let db = MemoryDb::new();
    let container = container(&db, aggregate_schema(), None).await;
    // No migration: every index stays disabled.
    let ctx = container.main_context();

    ctx.insert(&user("a", "x@x", 1)).unwrap();
    ctx.save().await.unwrap();

    for name in [
        "idx_email_count",
        "idx_score_sum",
        "idx_score_max",
        "idx_score_min",
        "idx_versions",
    ] {
        let sub = container.keyspace().index_subspace(name);
        assert_eq!(db.count_prefix(sub.prefix()), 0, "index {name}");
    }
}
