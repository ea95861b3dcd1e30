use chrono::NaiveDate;
use tempfile::tempdir;

use moc::{
    AttributeInput, AttributeTypeSpec, ChangeType, CollectionDef, CollectionId, Currency, DataType,
    Id, IngestApi, MocConfig, MocError, MocResult, MocStore, NamedDef, ReadApi, SchemaAdminApi,
    SchemaBatch, SourceDef, SubjectRef, UpsertAttributeValueInput, Value,
};

struct Fixture {
    store: MocStore,
    entity_type: Id,
    c1: CollectionId,
    c2: CollectionId,
    vat_attr: Id,
    price_attr: Id,
    span_attr: Id,
}

async fn setup(base: &std::path::Path) -> MocResult<Fixture> {
    let config = MocConfig::default_sqlite(base.join("moc.sqlite").to_string_lossy());
    let store = MocStore::connect(&config, base).await?;

    let entity_type = NamedDef {
        id: Id::new(),
        name: "legal_entity".to_string(),
    };
    let source = SourceDef {
        id: Id::new(),
        name: "registry".to_string(),
        active: true,
    };
    let c1 = CollectionDef {
        id: CollectionId(Id::new()),
        source_id: source.id,
        name: "registry-2020".to_string(),
        published: true,
        deleted: false,
    };
    let c2 = CollectionDef {
        id: CollectionId(Id::new()),
        source_id: source.id,
        name: "registry-2021".to_string(),
        published: true,
        deleted: false,
    };
    let string_type = AttributeTypeSpec::new("string", DataType::String);
    let mut price_type = AttributeTypeSpec::new("price", DataType::FixedPoint);
    price_type.decimal_places = Some(2);
    let span_type = AttributeTypeSpec::new("employee_span", DataType::RangeInt);
    let vat_attr = AttributeInput {
        id: Id::new(),
        name: "legal_entity_vat_number".to_string(),
        attribute_type_id: string_type.id,
        entity_type_id: Some(entity_type.id),
        collection_id: None,
        parent_id: None,
    };
    let price_attr = AttributeInput {
        id: Id::new(),
        name: "share_capital".to_string(),
        attribute_type_id: price_type.id,
        entity_type_id: Some(entity_type.id),
        collection_id: None,
        parent_id: None,
    };
    let span_attr = AttributeInput {
        id: Id::new(),
        name: "employee_count".to_string(),
        attribute_type_id: span_type.id,
        entity_type_id: Some(entity_type.id),
        collection_id: None,
        parent_id: None,
    };

    let fixture = Fixture {
        entity_type: entity_type.id,
        c1: c1.id,
        c2: c2.id,
        vat_attr: vat_attr.id,
        price_attr: price_attr.id,
        span_attr: span_attr.id,
        store,
    };
    fixture
        .store
        .upsert_schema_batch(SchemaBatch {
            entity_types: vec![entity_type],
            sources: vec![source],
            collections: vec![c1, c2],
            attribute_types: vec![string_type, price_type, span_type],
            attributes: vec![vat_attr, price_attr, span_attr],
            ..SchemaBatch::default()
        })
        .await?;
    Ok(fixture)
}

fn claim(
    subject: SubjectRef,
    attribute_id: Id,
    raw: &str,
    collection_id: CollectionId,
) -> UpsertAttributeValueInput {
    UpsertAttributeValueInput {
        subject,
        attribute_id,
        raw_value: raw.to_string(),
        currency: None,
        collection_id,
        valid_from: None,
        valid_to: None,
    }
}

#[tokio::test]
async fn same_value_from_two_collections_shares_one_row() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;
    let entity = f.store.register_entity("Sirius a.s.", f.entity_type).await?;
    let subject = SubjectRef::Entity(entity.id);

    let first = f
        .store
        .upsert_attribute_value(claim(subject, f.vat_attr, "12345678", f.c1))
        .await?;
    let second = f
        .store
        .upsert_attribute_value(claim(subject, f.vat_attr, "12345678", f.c2))
        .await?;
    assert_eq!(first.attribute_value_id, second.attribute_value_id);
    assert_ne!(first.id, second.id);

    let canonical = f.store.get_canonical_values(subject, f.vat_attr).await?;
    assert_eq!(canonical.len(), 1);
    assert_eq!(canonical[0].value, Value::String("12345678".to_string()));
    assert_eq!(canonical[0].provenance.len(), 2);

    let history = f.store.get_change_history(subject, None, 0, 10).await?;
    assert_eq!(history.len(), 2);
    // Newest first: the reuse, then the original create.
    assert_eq!(history[0].change_type, ChangeType::Update);
    assert_eq!(history[1].change_type, ChangeType::Create);
    assert_ne!(history[0].changeset_id, history[1].changeset_id);
    assert_eq!(history[0].collection_id, f.c2);
    assert_eq!(history[1].collection_id, f.c1);
    Ok(())
}

#[tokio::test]
async fn identical_reassertion_is_a_noop() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;
    let entity = f.store.register_entity("Sirius a.s.", f.entity_type).await?;
    let subject = SubjectRef::Entity(entity.id);

    let first = f
        .store
        .upsert_attribute_value(claim(subject, f.vat_attr, "12345678", f.c1))
        .await?;
    let second = f
        .store
        .upsert_attribute_value(claim(subject, f.vat_attr, "12345678", f.c1))
        .await?;
    assert_eq!(first.id, second.id);
    assert_eq!(first.updated_at, second.updated_at);

    let history = f.store.get_change_history(subject, None, 0, 10).await?;
    assert_eq!(history.len(), 1);
    Ok(())
}

#[tokio::test]
async fn window_only_change_still_logs() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;
    let entity = f.store.register_entity("Sirius a.s.", f.entity_type).await?;
    let subject = SubjectRef::Entity(entity.id);

    f.store
        .upsert_attribute_value(claim(subject, f.vat_attr, "12345678", f.c1))
        .await?;
    let mut dated = claim(subject, f.vat_attr, "12345678", f.c1);
    dated.valid_from = NaiveDate::from_ymd_opt(2020, 1, 1);
    let link = f.store.upsert_attribute_value(dated).await?;
    assert_eq!(link.valid_from, NaiveDate::from_ymd_opt(2020, 1, 1));

    let canonical = f.store.get_canonical_values(subject, f.vat_attr).await?;
    assert_eq!(canonical.len(), 1);
    let history = f.store.get_change_history(subject, None, 0, 10).await?;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].new_valid_from, NaiveDate::from_ymd_opt(2020, 1, 1));
    assert_eq!(history[0].old_valid_from, None);
    Ok(())
}

#[tokio::test]
async fn exclusive_content_change_updates_in_place() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;
    let entity = f.store.register_entity("Sirius a.s.", f.entity_type).await?;
    let subject = SubjectRef::Entity(entity.id);

    let first = f
        .store
        .upsert_attribute_value(claim(subject, f.vat_attr, "11111111", f.c1))
        .await?;
    let second = f
        .store
        .upsert_attribute_value(claim(subject, f.vat_attr, "22222222", f.c1))
        .await?;
    assert_eq!(first.attribute_value_id, second.attribute_value_id);

    let canonical = f.store.get_canonical_values(subject, f.vat_attr).await?;
    assert_eq!(canonical.len(), 1);
    assert_eq!(canonical[0].value, Value::String("22222222".to_string()));

    let history = f.store.get_change_history(subject, None, 0, 10).await?;
    assert_eq!(history.len(), 2);
    assert_eq!(
        history[0].old_value,
        Some(Value::String("11111111".to_string()))
    );
    assert_eq!(
        history[0].new_value,
        Some(Value::String("22222222".to_string()))
    );
    assert_eq!(history[0].new_display.as_deref(), Some("22222222"));
    Ok(())
}

#[tokio::test]
async fn shared_content_change_splits_off_a_new_row() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;
    let entity = f.store.register_entity("Sirius a.s.", f.entity_type).await?;
    let subject = SubjectRef::Entity(entity.id);

    f.store
        .upsert_attribute_value(claim(subject, f.vat_attr, "11111111", f.c1))
        .await?;
    f.store
        .upsert_attribute_value(claim(subject, f.vat_attr, "11111111", f.c2))
        .await?;
    // C2 changes its mind; C1 still owns the shared row.
    f.store
        .upsert_attribute_value(claim(subject, f.vat_attr, "22222222", f.c2))
        .await?;

    let mut canonical = f.store.get_canonical_values(subject, f.vat_attr).await?;
    canonical.sort_by(|a, b| a.encoded.cmp(&b.encoded));
    assert_eq!(canonical.len(), 2);
    assert_eq!(canonical[0].provenance.len(), 1);
    assert_eq!(canonical[0].provenance[0].collection_id, f.c1);
    assert_eq!(canonical[1].provenance.len(), 1);
    assert_eq!(canonical[1].provenance[0].collection_id, f.c2);
    Ok(())
}

#[tokio::test]
async fn reassertion_relinks_and_deletes_orphaned_row() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;
    let entity = f.store.register_entity("Sirius a.s.", f.entity_type).await?;
    let subject = SubjectRef::Entity(entity.id);

    f.store
        .upsert_attribute_value(claim(subject, f.vat_attr, "11111111", f.c1))
        .await?;
    f.store
        .upsert_attribute_value(claim(subject, f.vat_attr, "22222222", f.c2))
        .await?;
    // C2 now agrees with C1; its old row has no other owner and must go.
    f.store
        .upsert_attribute_value(claim(subject, f.vat_attr, "11111111", f.c2))
        .await?;

    let canonical = f.store.get_canonical_values(subject, f.vat_attr).await?;
    assert_eq!(canonical.len(), 1);
    assert_eq!(canonical[0].value, Value::String("11111111".to_string()));
    assert_eq!(canonical[0].provenance.len(), 2);
    Ok(())
}

#[tokio::test]
async fn fixed_point_stores_scaled_integer() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;
    let entity = f.store.register_entity("Sirius a.s.", f.entity_type).await?;
    let subject = SubjectRef::Entity(entity.id);

    let mut input = claim(subject, f.price_attr, "19.99", f.c1);
    input.currency = Some(Currency::parse("CZK")?);
    f.store.upsert_attribute_value(input).await?;

    let canonical = f.store.get_canonical_values(subject, f.price_attr).await?;
    assert_eq!(canonical.len(), 1);
    assert_eq!(canonical[0].value, Value::FixedPoint(1999));
    assert_eq!(canonical[0].encoded, "19.99");
    assert_eq!(
        canonical[0].currency.as_ref().map(|c| c.as_str()),
        Some("CZK")
    );
    Ok(())
}

#[tokio::test]
async fn currency_is_rejected_outside_fixed_point() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;
    let entity = f.store.register_entity("Sirius a.s.", f.entity_type).await?;
    let subject = SubjectRef::Entity(entity.id);

    let mut input = claim(subject, f.vat_attr, "12345678", f.c1);
    input.currency = Some(Currency::parse("CZK")?);
    let err = f.store.upsert_attribute_value(input).await.unwrap_err();
    assert!(matches!(err, MocError::Schema { .. }));
    Ok(())
}

#[tokio::test]
async fn open_range_survives_the_store_roundtrip() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;
    let entity = f.store.register_entity("Sirius a.s.", f.entity_type).await?;
    let subject = SubjectRef::Entity(entity.id);

    f.store
        .upsert_attribute_value(claim(subject, f.span_attr, "10 -> ", f.c1))
        .await?;
    let canonical = f.store.get_canonical_values(subject, f.span_attr).await?;
    assert_eq!(
        canonical[0].value,
        Value::RangeInt {
            from: Some(10),
            to: None
        }
    );
    assert_eq!(canonical[0].encoded, "10 -> ");

    let history = f.store.get_change_history(subject, None, 0, 10).await?;
    assert_eq!(history[0].new_display.as_deref(), Some("10 -> null"));
    Ok(())
}

#[tokio::test]
async fn failed_claims_leave_the_store_untouched() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;
    let entity = f.store.register_entity("Sirius a.s.", f.entity_type).await?;
    let other_type = NamedDef {
        id: Id::new(),
        name: "person".to_string(),
    };
    f.store
        .upsert_schema_batch(SchemaBatch {
            entity_types: vec![other_type.clone()],
            ..SchemaBatch::default()
        })
        .await?;
    let person = f.store.register_entity("Jan Novák", other_type.id).await?;
    let subject = SubjectRef::Entity(entity.id);

    // Bad number for a fixed-point attribute.
    let err = f
        .store
        .upsert_attribute_value(claim(subject, f.price_attr, "a lot", f.c1))
        .await
        .unwrap_err();
    assert!(matches!(err, MocError::Format { .. }));

    // Entity-scoped attribute against the wrong entity type.
    let err = f
        .store
        .upsert_attribute_value(claim(
            SubjectRef::Entity(person.id),
            f.vat_attr,
            "12345678",
            f.c1,
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, MocError::Schema { .. }));

    // Reversed range bounds.
    let err = f
        .store
        .upsert_attribute_value(claim(subject, f.span_attr, "9 -> 1", f.c1))
        .await
        .unwrap_err();
    assert!(matches!(err, MocError::Format { .. }));

    for probe in [subject, SubjectRef::Entity(person.id)] {
        assert!(f.store.materialize(probe, None).await?.values.is_empty());
        assert!(f.store.get_change_history(probe, None, 0, 10).await?.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn materialize_projects_all_canonical_values() -> MocResult<()> {
    let dir = tempdir().expect("tempdir");
    let f = setup(dir.path()).await?;
    let entity = f.store.register_entity("Sirius a.s.", f.entity_type).await?;
    let subject = SubjectRef::Entity(entity.id);

    f.store
        .upsert_attribute_value(claim(subject, f.vat_attr, "12345678", f.c1))
        .await?;
    let mut priced = claim(subject, f.price_attr, "100.00", f.c1);
    priced.currency = Some(Currency::parse("EUR")?);
    f.store.upsert_attribute_value(priced).await?;

    let all = f.store.materialize(subject, None).await?;
    assert_eq!(all.values.len(), 2);

    let only_vat = f
        .store
        .materialize(subject, Some(vec![f.vat_attr]))
        .await?;
    assert_eq!(only_vat.values.len(), 1);
    assert_eq!(only_vat.values[0].attribute_id, f.vat_attr);
    Ok(())
}
