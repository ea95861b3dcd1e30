use chrono::NaiveDate;
use tempfile::tempdir;

use moc::{
    AttributeInput, AttributeTypeSpec, ChangeType, CollectionDef, CollectionId, ConnectionPeers,
    DataType, Id, IngestApi, MocConfig, MocError, MocResult, MocStore, NamedDef, ReadApi,
    SchemaAdminApi, SchemaBatch, SourceDef, SubjectRef, UpsertAttributeValueInput,
    UpsertConnectionInput, Value,
};

struct Fixture {
    store: MocStore,
    knows: Id,
    c1: CollectionId,
    c2: CollectionId,
    note_attr: Id,
    alice: Id,
    bob: Id,
}

async fn setup(base: &std::path::Path) -> MocResult<Fixture> {
    let config = MocConfig::default_sqlite(base.join("moc.sqlite").to_string_lossy());
    let store = MocStore::connect(&config, base).await?;

    let person = NamedDef {
        id: Id::new(),
        name: "person".to_string(),
    };
    let knows = NamedDef {
        id: Id::new(),
        name: "knows".to_string(),
    };
    let source = SourceDef {
        id: Id::new(),
        name: "press".to_string(),
        active: true,
    };
    let c1 = CollectionDef {
        id: CollectionId(Id::new()),
        source_id: source.id,
        name: "press-2020".to_string(),
        published: true,
        deleted: false,
    };
    let c2 = CollectionDef {
        id: CollectionId(Id::new()),
        source_id: source.id,
        name: "press-2021".to_string(),
        published: true,
        deleted: false,
    };
    let string_type = AttributeTypeSpec::new("string", DataType::String);
    let note_attr = AttributeInput {
        id: Id::new(),
        name: "connection_note".to_string(),
        attribute_type_id: string_type.id,
        entity_type_id: None,
        collection_id: Some(c1.id),
        parent_id: None,
    };

    let fixture_ids = (knows.id, c1.id, c2.id, note_attr.id);
    store
        .upsert_schema_batch(SchemaBatch {
            entity_types: vec![person.clone()],
            connection_types: vec![knows],
            sources: vec![source],
            collections: vec![c1, c2],
            attribute_types: vec![string_type],
            attributes: vec![note_attr],
            ..SchemaBatch::default()
        })
        .await?;
    let alice = store.register_entity("Alice Small", person.id).await?;
    let bob = store.register_entity("Bob Big", person.id).await?;
    Ok(Fixture {
        store,
        knows: fixture_ids.0,
        c1: fixture_ids.1,
        c2: fixture_ids.2,
        note_attr: fixture_ids.3,
        alice: alice.id,
        bob: bob.id,
    })
}

fn connect_input(
    a: Id,
    kind: Id,
    b: Id,
    collection_id: CollectionId,
    valid_from: Option<NaiveDate>,
) -> UpsertConnectionInput {
    UpsertConnectionInput {
        peers: Some(ConnectionPeers {
            entity_a: a,
            connection_type_id: kind,
            entity_b: b,
        }),
        update_connection: None,
        valid_from,
        valid_to: None,
        transaction: None,
        collection_id,
    }
}

#[tokio::test]
async fn swapped_endpoints_resolve_to_one_connection() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;

    let first = f
        .store
        .upsert_connection(connect_input(f.alice, f.knows, f.bob, f.c1, None))
        .await?;
    let second = f
        .store
        .upsert_connection(connect_input(f.bob, f.knows, f.alice, f.c2, None))
        .await?;
    assert_eq!(first.connection_id, second.connection_id);
    assert_ne!(first.id, second.id);

    let history = f
        .store
        .get_connection_history(first.connection_id, 0, 10)
        .await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].change_type, ChangeType::Update);
    assert_eq!(history[1].change_type, ChangeType::Create);
    Ok(())
}

#[tokio::test]
async fn distinct_windows_make_distinct_connections() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;

    let open = f
        .store
        .upsert_connection(connect_input(f.alice, f.knows, f.bob, f.c1, None))
        .await?;
    let dated = f
        .store
        .upsert_connection(connect_input(
            f.alice,
            f.knows,
            f.bob,
            f.c1,
            NaiveDate::from_ymd_opt(2020, 1, 1),
        ))
        .await?;
    assert_ne!(open.connection_id, dated.connection_id);
    Ok(())
}

#[tokio::test]
async fn connection_endpoints_must_differ() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;

    let err = f
        .store
        .upsert_connection(connect_input(f.alice, f.knows, f.alice, f.c1, None))
        .await
        .unwrap_err();
    assert!(matches!(err, MocError::Schema { .. }));
    Ok(())
}

#[tokio::test]
async fn update_path_moves_the_window_in_place() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;

    let link = f
        .store
        .upsert_connection(connect_input(
            f.alice,
            f.knows,
            f.bob,
            f.c1,
            NaiveDate::from_ymd_opt(2020, 1, 1),
        ))
        .await?;
    let moved = f
        .store
        .upsert_connection(UpsertConnectionInput {
            peers: None,
            update_connection: Some(link.connection_id),
            valid_from: NaiveDate::from_ymd_opt(2021, 1, 1),
            valid_to: None,
            transaction: None,
            collection_id: f.c2,
        })
        .await?;
    assert_eq!(moved.connection_id, link.connection_id);

    let record = f.store.get_connection(link.connection_id).await?;
    assert_eq!(record.valid_from, NaiveDate::from_ymd_opt(2021, 1, 1));

    let history = f
        .store
        .get_connection_history(link.connection_id, 0, 10)
        .await?;
    assert_eq!(history.len(), 2);
    let update = &history[0];
    assert_eq!(
        update.old_state.as_ref().and_then(|s| s.valid_from),
        NaiveDate::from_ymd_opt(2020, 1, 1)
    );
    assert_eq!(
        update.new_state.as_ref().and_then(|s| s.valid_from),
        NaiveDate::from_ymd_opt(2021, 1, 1)
    );
    Ok(())
}

#[tokio::test]
async fn colliding_update_migrates_identity() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;

    let old = f
        .store
        .upsert_connection(connect_input(
            f.alice,
            f.knows,
            f.bob,
            f.c1,
            NaiveDate::from_ymd_opt(2020, 1, 1),
        ))
        .await?;
    let survivor = f
        .store
        .upsert_connection(connect_input(
            f.alice,
            f.knows,
            f.bob,
            f.c1,
            NaiveDate::from_ymd_opt(2021, 1, 1),
        ))
        .await?;
    assert_ne!(old.connection_id, survivor.connection_id);

    // Attach an attribute value to the row about to be replaced.
    f.store
        .upsert_attribute_value(UpsertAttributeValueInput {
            subject: SubjectRef::Connection(old.connection_id),
            attribute_id: f.note_attr,
            raw_value: "met at a conference".to_string(),
            currency: None,
            collection_id: f.c1,
            valid_from: None,
            valid_to: None,
        })
        .await?;

    let moved = f
        .store
        .upsert_connection(UpsertConnectionInput {
            peers: None,
            update_connection: Some(old.connection_id),
            valid_from: NaiveDate::from_ymd_opt(2021, 1, 1),
            valid_to: None,
            transaction: None,
            collection_id: f.c2,
        })
        .await?;
    assert_eq!(moved.connection_id, survivor.connection_id);

    // The old row is gone, its dependents live on the survivor.
    let err = f.store.get_connection(old.connection_id).await.unwrap_err();
    assert!(matches!(err, MocError::NotFound { .. }));
    let canonical = f
        .store
        .get_canonical_values(SubjectRef::Connection(survivor.connection_id), f.note_attr)
        .await?;
    assert_eq!(canonical.len(), 1);
    assert_eq!(
        canonical[0].value,
        Value::String("met at a conference".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn colliding_update_merges_equal_values() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;

    let old = f
        .store
        .upsert_connection(connect_input(
            f.alice,
            f.knows,
            f.bob,
            f.c1,
            NaiveDate::from_ymd_opt(2020, 1, 1),
        ))
        .await?;
    let survivor = f
        .store
        .upsert_connection(connect_input(
            f.alice,
            f.knows,
            f.bob,
            f.c1,
            NaiveDate::from_ymd_opt(2021, 1, 1),
        ))
        .await?;

    // Both rows carry the same note from the same collection.
    for target in [old.connection_id, survivor.connection_id] {
        f.store
            .upsert_attribute_value(UpsertAttributeValueInput {
                subject: SubjectRef::Connection(target),
                attribute_id: f.note_attr,
                raw_value: "met at a conference".to_string(),
                currency: None,
                collection_id: f.c1,
                valid_from: None,
                valid_to: None,
            })
            .await?;
    }

    f.store
        .upsert_connection(UpsertConnectionInput {
            peers: None,
            update_connection: Some(old.connection_id),
            valid_from: NaiveDate::from_ymd_opt(2021, 1, 1),
            valid_to: None,
            transaction: None,
            collection_id: f.c1,
        })
        .await?;

    let canonical = f
        .store
        .get_canonical_values(SubjectRef::Connection(survivor.connection_id), f.note_attr)
        .await?;
    assert_eq!(canonical.len(), 1);
    assert_eq!(canonical[0].provenance.len(), 1);
    Ok(())
}

#[tokio::test]
async fn update_with_unchanged_window_only_links() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;

    let link = f
        .store
        .upsert_connection(connect_input(
            f.alice,
            f.knows,
            f.bob,
            f.c1,
            NaiveDate::from_ymd_opt(2020, 1, 1),
        ))
        .await?;
    let relink = f
        .store
        .upsert_connection(UpsertConnectionInput {
            peers: None,
            update_connection: Some(link.connection_id),
            valid_from: NaiveDate::from_ymd_opt(2020, 1, 1),
            valid_to: None,
            transaction: None,
            collection_id: f.c2,
        })
        .await?;
    assert_eq!(relink.connection_id, link.connection_id);

    // Only the original create is logged.
    let history = f
        .store
        .get_connection_history(link.connection_id, 0, 10)
        .await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].change_type, ChangeType::Create);
    Ok(())
}

#[tokio::test]
async fn exact_reassertion_reactivates_a_deleted_connection() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;

    let link = f
        .store
        .upsert_connection(connect_input(f.alice, f.knows, f.bob, f.c1, None))
        .await?;
    f.store
        .soft_delete_connection(link.connection_id, f.c1)
        .await?;
    let retired = f.store.get_connection(link.connection_id).await?;
    assert!(retired.deleted);
    assert!(!retired.published);

    // Updating a retired connection is a conflict; re-asserting revives it.
    let err = f
        .store
        .upsert_connection(UpsertConnectionInput {
            peers: None,
            update_connection: Some(link.connection_id),
            valid_from: NaiveDate::from_ymd_opt(2021, 1, 1),
            valid_to: None,
            transaction: None,
            collection_id: f.c1,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, MocError::Conflict { .. }));

    let revived = f
        .store
        .upsert_connection(connect_input(f.alice, f.knows, f.bob, f.c2, None))
        .await?;
    assert_eq!(revived.connection_id, link.connection_id);
    let record = f.store.get_connection(link.connection_id).await?;
    assert!(!record.deleted);
    assert!(record.published);
    Ok(())
}

#[tokio::test]
async fn both_connection_paths_at_once_are_rejected() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;

    let mut input = connect_input(f.alice, f.knows, f.bob, f.c1, None);
    input.update_connection = Some(Id::new());
    let err = f.store.upsert_connection(input).await.unwrap_err();
    assert!(matches!(err, MocError::Schema { .. }));
    Ok(())
}
