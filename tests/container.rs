//! Container lifecycle: directories, the store cache, metadata layouts and
//! index-backed queries.

use assert_matches::assert_matches;

use std::sync::Arc;

use recorddb::{
    Container, ContainerOptions, Database, DirectoryLayer, Error, MetadataLayout, Subspace, Tuple,
};

mod common;
use common::{
    container, schema_v2, test_options, unique_email_index, user_entity, order_entity, MemoryDb,
    TestDirectory, User,
};
use recorddb::{Schema, Version};

#[tokio::test]
async fn directory_operations_pass_through() {
    let db = MemoryDb::new();
    let container = container(&db, schema_v2(), None).await;

    assert!(!container.directory_exists(&["tenants", "acme"]).await.unwrap());
    let acme = container.get_or_open(&["tenants", "acme"]).await.unwrap();
    assert!(container.directory_exists(&["tenants", "acme"]).await.unwrap());

    // Re-opening resolves the same prefix.
    let again = container.get_or_open(&["tenants", "acme"]).await.unwrap();
    assert_eq!(acme, again);
    assert_eq!(container.open(&["tenants", "acme"]).await.unwrap(), acme);

    // Moving keeps the prefix under the new path.
    let moved = container
        .move_directory(&["tenants", "acme"], &["tenants", "acme-inc"])
        .await
        .unwrap();
    assert_eq!(moved, acme);
    assert!(!container.directory_exists(&["tenants", "acme"]).await.unwrap());

    assert!(container.remove_directory(&["tenants", "acme-inc"]).await.unwrap());
    assert!(!container
        .directory_exists(&["tenants", "acme-inc"])
        .await
        .unwrap());
}

#[tokio::test]
async fn create_with_explicit_prefix_and_duplicate_rejection() {
    let db = MemoryDb::new();
    let container = container(&db, schema_v2(), None).await;

    let fixed = container
        .create(&["fixed"], Some(vec![0x77]))
        .await
        .unwrap();
    assert_eq!(fixed.prefix(), &[0x77]);
    assert_matches!(
        container.create(&["fixed"], None).await,
        Err(Error::InvalidArgument(_))
    );
}

#[tokio::test]
async fn store_handles_are_cached_per_subspace() {
    let db = MemoryDb::new();
    let container = container(&db, schema_v2(), None).await;

    let a = container.store(container.subspace());
    let b = container.store(container.subspace());
    assert!(Arc::ptr_eq(&a, &b));

    let elsewhere = Subspace::from_bytes(vec![0x42]);
    let c = container.store(&elsewhere);
    assert!(!Arc::ptr_eq(&a, &c));
}

#[tokio::test]
async fn shared_metadata_layout_uses_the_fixed_prefix() {
    let db = MemoryDb::new();
    let mut options = test_options();
    options.metadata_layout = MetadataLayout::Shared;
    let database: Arc<dyn Database> = db.clone();
    let directory: Arc<dyn DirectoryLayer> = TestDirectory::new();
    let container = Container::new(database, directory, schema_v2(), None, options)
        .await
        .unwrap();

    assert_eq!(container.metadata().subspace().prefix(), &[0xFE]);
    container
        .set_current_schema_version(Version::new(2, 0, 0))
        .await
        .unwrap();
    let version_key = container.metadata().version_key();
    assert!(version_key.starts_with(&[0xFE]));
    assert!(db.read(&version_key).is_some());
}

#[tokio::test]
async fn with_subspace_bypasses_directory_resolution() {
    let db = MemoryDb::new();
    let database: Arc<dyn Database> = db.clone();
    let directory: Arc<dyn DirectoryLayer> = TestDirectory::new();
    let container = Container::with_subspace(
        database,
        directory,
        schema_v2(),
        None,
        Subspace::from_bytes(vec![0x33]),
        ContainerOptions::default(),
    )
    .unwrap();

    assert_eq!(container.subspace().prefix(), &[0x33]);
    // Tenant metadata hangs off the explicit root.
    assert!(container
        .metadata()
        .subspace()
        .prefix()
        .starts_with(&[0x33]));
}

#[tokio::test]
async fn query_index_returns_ids_for_readable_scalar_indexes() {
    let db = MemoryDb::new();
    let container = container(&db, schema_v2(), None).await;
    container.migrate_if_needed().await.unwrap();
    let ctx = container.main_context();

    for (id, email) in [("a", "a@x"), ("b", "b@x"), ("c", "b@x")] {
        ctx.insert(&User::new(id, email)).unwrap();
    }
    ctx.save().await.unwrap();

    let ids = container
        .query_index("idx_email", &Tuple::from_element("b@x"))
        .await
        .unwrap();
    assert_eq!(
        ids,
        vec![Tuple::from_element("b"), Tuple::from_element("c")]
    );
}

#[tokio::test]
async fn query_index_resolves_unique_indexes_through_values() {
    let db = MemoryDb::new();
    let schema = Schema::new(
        Version::new(1, 0, 0),
        vec![user_entity(vec![unique_email_index()]), order_entity(Vec::new())],
    )
    .unwrap();
    let container = container(&db, schema, None).await;
    container.migrate_if_needed().await.unwrap();
    let ctx = container.main_context();
    ctx.insert(&User::new("u9", "z@x")).unwrap();
    ctx.save().await.unwrap();

    let ids = container
        .query_index("idx_email", &Tuple::from_element("z@x"))
        .await
        .unwrap();
    assert_eq!(ids, vec![Tuple::from_element("u9")]);
}

#[tokio::test]
async fn querying_an_unreadable_index_is_rejected() {
    let db = MemoryDb::new();
    let container = container(&db, schema_v2(), None).await;
    // The index exists but was never enabled, let alone promoted.
    assert_matches!(
        container
            .query_index("idx_email", &Tuple::from_element("a@x"))
            .await,
        Err(Error::InvalidArgument(_))
    );
    assert_matches!(
        container.query_index("idx_ghost", &Tuple::new()).await,
        Err(Error::NotFound { .. })
    );
}

#[tokio::test]
async fn contexts_share_the_container_but_not_staging() {
    let db = MemoryDb::new();
    let container = container(&db, schema_v2(), None).await;

    let main = container.main_context();
    assert!(Arc::ptr_eq(&main, &container.main_context()));

    let background = container.new_context(false);
    background.insert(&User::new("u1", "a@x")).unwrap();
    assert!(background.has_changes());
    assert!(!main.has_changes());
}

#[tokio::test]
async fn query_index_prefix_must_not_leak_unrelated_entries() {
    let db = MemoryDb::new();
    let container = container(&db, schema_v2(), None).await;
    container.migrate_if_needed().await.unwrap();
    let ctx = container.main_context();
    ctx.insert(&User::new("a", "match@x")).unwrap();
    ctx.insert(&User::new("b", "other@x")).unwrap();
    ctx.save().await.unwrap();

    let ids = container
        .query_index("idx_email", &Tuple::from_element("match@x"))
        .await
        .unwrap();
    assert_eq!(ids, vec![Tuple::from_element("a")]);

    // An empty prefix scans the whole index.
    let all = container.query_index("idx_email", &Tuple::new()).await.unwrap();
    assert_eq!(all.len(), 2);
}
