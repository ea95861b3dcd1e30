use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

use crate::db::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();

        manager
            .create_table(
                Table::create()
                    .table(MocEntityTypes::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocEntityTypes::EntityTypeId, false))
                    .col(ColumnDef::new(MocEntityTypes::Name).string().not_null())
                    .primary_key(
                        Index::create()
                            .name("pk_moc_entity_types")
                            .col(MocEntityTypes::EntityTypeId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocConnectionTypes::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocConnectionTypes::ConnectionTypeId, false))
                    .col(ColumnDef::new(MocConnectionTypes::Name).string().not_null())
                    .primary_key(
                        Index::create()
                            .name("pk_moc_connection_types")
                            .col(MocConnectionTypes::ConnectionTypeId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocSources::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocSources::SourceId, false))
                    .col(ColumnDef::new(MocSources::Name).string().not_null())
                    .col(
                        ColumnDef::new(MocSources::Active)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_moc_sources")
                            .col(MocSources::SourceId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocCollections::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocCollections::CollectionId, false))
                    .col(id_col(backend, MocCollections::SourceId, false))
                    .col(ColumnDef::new(MocCollections::Name).string().not_null())
                    .col(
                        ColumnDef::new(MocCollections::Published)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(MocCollections::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_moc_collections")
                            .col(MocCollections::CollectionId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocEntities::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocEntities::EntityId, false))
                    .col(ColumnDef::new(MocEntities::PublicId).string().not_null())
                    .col(id_col(backend, MocEntities::EntityTypeId, false))
                    .col(
                        ColumnDef::new(MocEntities::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_moc_entities")
                            .col(MocEntities::EntityId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("moc_entities_public_id_uq")
                    .table(MocEntities::Table)
                    .col(MocEntities::PublicId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocCodebooks::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocCodebooks::CodebookId, false))
                    .col(ColumnDef::new(MocCodebooks::Name).string().not_null())
                    .primary_key(
                        Index::create()
                            .name("pk_moc_codebooks")
                            .col(MocCodebooks::CodebookId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocCodebookValues::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocCodebookValues::CodebookValueId, false))
                    .col(id_col(backend, MocCodebookValues::CodebookId, false))
                    .col(ColumnDef::new(MocCodebookValues::Label).string().not_null())
                    .primary_key(
                        Index::create()
                            .name("pk_moc_codebook_values")
                            .col(MocCodebookValues::CodebookValueId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocAttributeTypes::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocAttributeTypes::AttributeTypeId, false))
                    .col(ColumnDef::new(MocAttributeTypes::Name).string().not_null())
                    .col(
                        ColumnDef::new(MocAttributeTypes::DataType)
                            .small_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(MocAttributeTypes::DecimalPlaces).integer())
                    .col(id_col(backend, MocAttributeTypes::CodebookId, true))
                    .col(ColumnDef::new(MocAttributeTypes::FromInclusive).boolean())
                    .col(ColumnDef::new(MocAttributeTypes::ToInclusive).boolean())
                    .primary_key(
                        Index::create()
                            .name("pk_moc_attribute_types")
                            .col(MocAttributeTypes::AttributeTypeId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocAttributes::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocAttributes::AttributeId, false))
                    .col(ColumnDef::new(MocAttributes::Name).string().not_null())
                    .col(id_col(backend, MocAttributes::AttributeTypeId, false))
                    .col(id_col(backend, MocAttributes::EntityTypeId, true))
                    .col(id_col(backend, MocAttributes::CollectionId, true))
                    .col(id_col(backend, MocAttributes::ParentAttributeId, true))
                    .primary_key(
                        Index::create()
                            .name("pk_moc_attributes")
                            .col(MocAttributes::AttributeId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocEntityConnections::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocEntityConnections::ConnectionId, false))
                    .col(id_col(backend, MocEntityConnections::EntityAId, false))
                    .col(id_col(backend, MocEntityConnections::EntityBId, false))
                    .col(id_col(backend, MocEntityConnections::ConnectionTypeId, false))
                    .col(ColumnDef::new(MocEntityConnections::ValidFrom).string_len(10))
                    .col(ColumnDef::new(MocEntityConnections::ValidTo).string_len(10))
                    .col(ColumnDef::new(MocEntityConnections::TxAmount).big_integer())
                    .col(ColumnDef::new(MocEntityConnections::TxCurrency).string_len(3))
                    .col(ColumnDef::new(MocEntityConnections::TxDate).string_len(10))
                    .col(
                        ColumnDef::new(MocEntityConnections::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(MocEntityConnections::Published)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_moc_entity_connections")
                            .col(MocEntityConnections::ConnectionId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("moc_entity_connections_pair_idx")
                    .table(MocEntityConnections::Table)
                    .col(MocEntityConnections::EntityAId)
                    .col(MocEntityConnections::EntityBId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocEntityConnectionCollections::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocEntityConnectionCollections::LinkId, false))
                    .col(id_col(
                        backend,
                        MocEntityConnectionCollections::ConnectionId,
                        false,
                    ))
                    .col(id_col(
                        backend,
                        MocEntityConnectionCollections::CollectionId,
                        false,
                    ))
                    .col(
                        ColumnDef::new(MocEntityConnectionCollections::Deleted)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(MocEntityConnectionCollections::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MocEntityConnectionCollections::UpdatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_moc_entity_connection_collections")
                            .col(MocEntityConnectionCollections::LinkId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("moc_entity_connection_collections_conn_idx")
                    .table(MocEntityConnectionCollections::Table)
                    .col(MocEntityConnectionCollections::ConnectionId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocAttributeValues::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocAttributeValues::AttributeValueId, false))
                    .col(id_col(backend, MocAttributeValues::EntityId, true))
                    .col(id_col(backend, MocAttributeValues::ConnectionId, true))
                    .col(id_col(backend, MocAttributeValues::AttributeId, false))
                    .col(ColumnDef::new(MocAttributeValues::ValueBoolean).boolean())
                    .col(ColumnDef::new(MocAttributeValues::ValueInt).big_integer())
                    .col(ColumnDef::new(MocAttributeValues::ValueIntTo).big_integer())
                    .col(ColumnDef::new(MocAttributeValues::ValueFloat).double())
                    .col(ColumnDef::new(MocAttributeValues::ValueFloatTo).double())
                    .col(ColumnDef::new(MocAttributeValues::ValueString).string())
                    .col(ColumnDef::new(MocAttributeValues::ValueText).text())
                    .col(ColumnDef::new(MocAttributeValues::ValueDatetime).big_integer())
                    .col(ColumnDef::new(MocAttributeValues::ValueDatetimeTo).big_integer())
                    .col(ColumnDef::new(MocAttributeValues::ValueDate).string_len(10))
                    .col(ColumnDef::new(MocAttributeValues::ValueDateTo).string_len(10))
                    .col(id_col(backend, MocAttributeValues::CodebookValueId, true))
                    .col(ColumnDef::new(MocAttributeValues::Currency).string_len(3))
                    .col(ColumnDef::new(MocAttributeValues::ContentKey).text().not_null())
                    .primary_key(
                        Index::create()
                            .name("pk_moc_attribute_values")
                            .col(MocAttributeValues::AttributeValueId),
                    )
                    .to_owned(),
            )
            .await?;

        // Backstop for concurrent ingestion: at most one canonical row per
        // subject+attribute+content.
        manager
            .create_index(
                Index::create()
                    .name("moc_attribute_values_content_uq")
                    .table(MocAttributeValues::Table)
                    .col(MocAttributeValues::EntityId)
                    .col(MocAttributeValues::ConnectionId)
                    .col(MocAttributeValues::AttributeId)
                    .col(MocAttributeValues::ContentKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocAttributeValueCollections::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocAttributeValueCollections::LinkId, false))
                    .col(id_col(
                        backend,
                        MocAttributeValueCollections::AttributeValueId,
                        false,
                    ))
                    .col(id_col(
                        backend,
                        MocAttributeValueCollections::CollectionId,
                        false,
                    ))
                    .col(ColumnDef::new(MocAttributeValueCollections::ValidFrom).string_len(10))
                    .col(ColumnDef::new(MocAttributeValueCollections::ValidTo).string_len(10))
                    .col(
                        ColumnDef::new(MocAttributeValueCollections::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(MocAttributeValueCollections::UpdatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_moc_attribute_value_collections")
                            .col(MocAttributeValueCollections::LinkId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("moc_attribute_value_collections_value_idx")
                    .table(MocAttributeValueCollections::Table)
                    .col(MocAttributeValueCollections::AttributeValueId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("moc_attribute_value_collections_collection_idx")
                    .table(MocAttributeValueCollections::Table)
                    .col(MocAttributeValueCollections::CollectionId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocChangesets::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocChangesets::ChangesetId, false))
                    .col(id_col(backend, MocChangesets::CollectionId, false))
                    .col(
                        ColumnDef::new(MocChangesets::CreatedAtHlc)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_moc_changesets")
                            .col(MocChangesets::ChangesetId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("moc_changesets_hlc_idx")
                    .table(MocChangesets::Table)
                    .col(MocChangesets::CreatedAtHlc)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocLogAttributeValueChanges::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocLogAttributeValueChanges::LogId, false))
                    .col(id_col(backend, MocLogAttributeValueChanges::ChangesetId, false))
                    .col(id_col(backend, MocLogAttributeValueChanges::EntityId, true))
                    .col(id_col(backend, MocLogAttributeValueChanges::ConnectionId, true))
                    .col(id_col(backend, MocLogAttributeValueChanges::AttributeId, false))
                    .col(
                        ColumnDef::new(MocLogAttributeValueChanges::ChangeType)
                            .small_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(MocLogAttributeValueChanges::OldValue).text())
                    .col(ColumnDef::new(MocLogAttributeValueChanges::NewValue).text())
                    .col(ColumnDef::new(MocLogAttributeValueChanges::OldCurrency).string_len(3))
                    .col(ColumnDef::new(MocLogAttributeValueChanges::NewCurrency).string_len(3))
                    .col(ColumnDef::new(MocLogAttributeValueChanges::OldValidFrom).string_len(10))
                    .col(ColumnDef::new(MocLogAttributeValueChanges::OldValidTo).string_len(10))
                    .col(ColumnDef::new(MocLogAttributeValueChanges::NewValidFrom).string_len(10))
                    .col(ColumnDef::new(MocLogAttributeValueChanges::NewValidTo).string_len(10))
                    .col(
                        ColumnDef::new(MocLogAttributeValueChanges::RecordedAtHlc)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_moc_log_attribute_value_changes")
                            .col(MocLogAttributeValueChanges::LogId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("moc_log_attribute_value_changes_entity_idx")
                    .table(MocLogAttributeValueChanges::Table)
                    .col(MocLogAttributeValueChanges::EntityId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("moc_log_attribute_value_changes_connection_idx")
                    .table(MocLogAttributeValueChanges::Table)
                    .col(MocLogAttributeValueChanges::ConnectionId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MocLogConnectionChanges::Table)
                    .if_not_exists()
                    .col(id_col(backend, MocLogConnectionChanges::LogId, false))
                    .col(id_col(backend, MocLogConnectionChanges::ChangesetId, false))
                    .col(id_col(backend, MocLogConnectionChanges::ConnectionId, false))
                    .col(
                        ColumnDef::new(MocLogConnectionChanges::ChangeType)
                            .small_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(MocLogConnectionChanges::OldState).text())
                    .col(ColumnDef::new(MocLogConnectionChanges::NewState).text())
                    .col(
                        ColumnDef::new(MocLogConnectionChanges::RecordedAtHlc)
                            .big_integer()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_moc_log_connection_changes")
                            .col(MocLogConnectionChanges::LogId),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("moc_log_connection_changes_connection_idx")
                    .table(MocLogConnectionChanges::Table)
                    .col(MocLogConnectionChanges::ConnectionId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for stmt in [
            Table::drop().table(MocLogConnectionChanges::Table).to_owned(),
            Table::drop()
                .table(MocLogAttributeValueChanges::Table)
                .to_owned(),
            Table::drop().table(MocChangesets::Table).to_owned(),
            Table::drop()
                .table(MocAttributeValueCollections::Table)
                .to_owned(),
            Table::drop().table(MocAttributeValues::Table).to_owned(),
            Table::drop()
                .table(MocEntityConnectionCollections::Table)
                .to_owned(),
            Table::drop().table(MocEntityConnections::Table).to_owned(),
            Table::drop().table(MocAttributes::Table).to_owned(),
            Table::drop().table(MocAttributeTypes::Table).to_owned(),
            Table::drop().table(MocCodebookValues::Table).to_owned(),
            Table::drop().table(MocCodebooks::Table).to_owned(),
            Table::drop().table(MocEntities::Table).to_owned(),
            Table::drop().table(MocCollections::Table).to_owned(),
            Table::drop().table(MocSources::Table).to_owned(),
            Table::drop().table(MocConnectionTypes::Table).to_owned(),
            Table::drop().table(MocEntityTypes::Table).to_owned(),
        ] {
            manager.drop_table(stmt).await?;
        }
        Ok(())
    }
}

fn id_col(backend: DatabaseBackend, col: impl Iden, nullable: bool) -> ColumnDef {
    let mut col_def = ColumnDef::new(col);
    match backend {
        DatabaseBackend::Postgres => {
            col_def.uuid();
        }
        DatabaseBackend::MySql => {
            col_def.binary_len(16);
        }
        _ => {
            col_def.string_len(36);
        }
    }
    if nullable {
        col_def.null();
    } else {
        col_def.not_null();
    }
    col_def.to_owned()
}
