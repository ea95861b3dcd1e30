use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sea_orm::sea_query;
use sea_orm::sea_query::{
    Cond, Expr, ExprTrait, MysqlQueryBuilder, OnConflict, Order, PostgresQueryBuilder, Query,
    QueryStatementWriter, SelectStatement, SqliteQueryBuilder, Value as SeaValue,
};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, QueryResult,
    Statement, TransactionTrait, TryGetable,
};
use sea_orm_migration::MigratorTrait;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use moc_core::{
    codec, AttributeDef, AttributeInput, AttributeTypeSpec, CanonicalValue, ChangeEntry,
    ChangeType, ChangesetId, CodebookValueRecord, CollectionId, ConnectionChangeEntry,
    ConnectionLink, ConnectionPeers, ConnectionRecord, ConnectionState, Currency, DataType,
    EntityRecord, FormatConfig, Hlc, Id, Materialized, MocError, MocResult, Provenance,
    SchemaBatch, SchemaGraph, Stamp, SubjectRef, TransactionInfo, UpsertAttributeValueInput,
    UpsertConnectionInput, Value, ValueLink, ValueSlots,
};

use crate::api::{IngestApi, ReadApi, SchemaAdminApi};
use crate::config::MocConfig;
use crate::db::*;
use crate::migration::Migrator;

#[derive(Clone)]
pub struct MocStore {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    format: FormatConfig,
}

#[derive(Clone, Copy, Debug)]
pub struct BackendCapabilities {
    pub transactional_ddl: bool,
    pub partial_indexes: bool,
    pub json_types: bool,
}

impl MocStore {
    pub async fn connect(config: &MocConfig, base_dir: &Path) -> MocResult<Self> {
        let url = build_connection_url(config, base_dir)?;
        let mut options = ConnectOptions::new(url);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        let conn = Database::connect(options).await.map_err(db_err)?;
        let backend = conn.get_database_backend();
        let store = Self {
            conn,
            backend,
            format: config.format.clone(),
        };
        Migrator::up(&store.conn, None).await.map_err(db_err)?;
        Ok(store)
    }

    pub async fn connect_sqlite(path: &Path) -> MocResult<Self> {
        let config = MocConfig::default_sqlite(path.to_string_lossy());
        Self::connect(&config, path.parent().unwrap_or_else(|| Path::new("."))).await
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn format(&self) -> &FormatConfig {
        &self.format
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        match self.backend {
            DatabaseBackend::Postgres => BackendCapabilities {
                transactional_ddl: true,
                partial_indexes: true,
                json_types: true,
            },
            DatabaseBackend::MySql => BackendCapabilities {
                transactional_ddl: false,
                partial_indexes: false,
                json_types: true,
            },
            _ => BackendCapabilities {
                transactional_ddl: false,
                partial_indexes: true,
                json_types: false,
            },
        }
    }

    async fn load_schema_graph<C: ConnectionTrait>(&self, conn: &C) -> MocResult<SchemaGraph> {
        let select_types = Query::select()
            .from(MocAttributeTypes::Table)
            .columns([
                MocAttributeTypes::AttributeTypeId,
                MocAttributeTypes::Name,
                MocAttributeTypes::DataType,
                MocAttributeTypes::DecimalPlaces,
                MocAttributeTypes::CodebookId,
                MocAttributeTypes::FromInclusive,
                MocAttributeTypes::ToInclusive,
            ])
            .to_owned();
        let mut types = Vec::new();
        for row in query_all(conn, &select_types).await? {
            let kind_raw: i16 = get(&row, MocAttributeTypes::DataType)?;
            let data_type = DataType::from_i16(kind_raw)
                .ok_or_else(|| MocError::storage(format!("unknown data type {kind_raw}")))?;
            let decimal_places: Option<i32> = get(&row, MocAttributeTypes::DecimalPlaces)?;
            types.push(AttributeTypeSpec {
                id: read_id(&row, MocAttributeTypes::AttributeTypeId)?,
                name: get(&row, MocAttributeTypes::Name)?,
                data_type,
                decimal_places: decimal_places.map(|v| v as u32),
                codebook_id: read_opt_id(&row, MocAttributeTypes::CodebookId)?,
                from_inclusive: get(&row, MocAttributeTypes::FromInclusive)?,
                to_inclusive: get(&row, MocAttributeTypes::ToInclusive)?,
            });
        }

        let select_attributes = Query::select()
            .from(MocAttributes::Table)
            .columns([
                MocAttributes::AttributeId,
                MocAttributes::Name,
                MocAttributes::AttributeTypeId,
                MocAttributes::EntityTypeId,
                MocAttributes::CollectionId,
                MocAttributes::ParentAttributeId,
            ])
            .to_owned();
        let mut attributes = Vec::new();
        for row in query_all(conn, &select_attributes).await? {
            let input = AttributeInput {
                id: read_id(&row, MocAttributes::AttributeId)?,
                name: get(&row, MocAttributes::Name)?,
                attribute_type_id: read_id(&row, MocAttributes::AttributeTypeId)?,
                entity_type_id: read_opt_id(&row, MocAttributes::EntityTypeId)?,
                collection_id: read_opt_id(&row, MocAttributes::CollectionId)?.map(CollectionId),
                parent_id: read_opt_id(&row, MocAttributes::ParentAttributeId)?,
            };
            let owner = input.owner()?;
            attributes.push(AttributeDef {
                id: input.id,
                name: input.name,
                attribute_type_id: input.attribute_type_id,
                owner,
            });
        }
        Ok(SchemaGraph::new(attributes, types))
    }

    async fn fetch_collection<C: ConnectionTrait>(
        &self,
        conn: &C,
        collection_id: CollectionId,
    ) -> MocResult<(Id, bool, bool)> {
        let select = Query::select()
            .from(MocCollections::Table)
            .columns([
                MocCollections::SourceId,
                MocCollections::Published,
                MocCollections::Deleted,
            ])
            .and_where(
                Expr::col(MocCollections::CollectionId).eq(id_value(self.backend, collection_id.0)),
            )
            .to_owned();
        let row = query_one(conn, &select)
            .await?
            .ok_or_else(|| MocError::not_found(format!("collection {collection_id}")))?;
        Ok((
            read_id(&row, MocCollections::SourceId)?,
            get(&row, MocCollections::Published)?,
            get(&row, MocCollections::Deleted)?,
        ))
    }

    async fn fetch_entity<C: ConnectionTrait>(
        &self,
        conn: &C,
        entity_id: Id,
    ) -> MocResult<EntityRecord> {
        let select = Query::select()
            .from(MocEntities::Table)
            .columns([
                MocEntities::EntityId,
                MocEntities::PublicId,
                MocEntities::EntityTypeId,
                MocEntities::Deleted,
            ])
            .and_where(Expr::col(MocEntities::EntityId).eq(id_value(self.backend, entity_id)))
            .to_owned();
        let row = query_one(conn, &select)
            .await?
            .ok_or_else(|| MocError::not_found(format!("entity {entity_id}")))?;
        Ok(EntityRecord {
            id: read_id(&row, MocEntities::EntityId)?,
            public_id: get(&row, MocEntities::PublicId)?,
            entity_type_id: read_id(&row, MocEntities::EntityTypeId)?,
            deleted: get(&row, MocEntities::Deleted)?,
        })
    }

    async fn fetch_connection_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        connection_id: Id,
    ) -> MocResult<Option<ConnectionRecord>> {
        let select = connection_select()
            .and_where(
                Expr::col(MocEntityConnections::ConnectionId)
                    .eq(id_value(self.backend, connection_id)),
            )
            .to_owned();
        match query_one(conn, &select).await? {
            Some(row) => Ok(Some(read_connection_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Collections a connection is linked to, filtered down to published,
    /// non-deleted collections of active sources.
    async fn active_collections<C: ConnectionTrait>(
        &self,
        conn: &C,
        connection_id: Id,
    ) -> MocResult<HashSet<CollectionId>> {
        let select_links = Query::select()
            .from(MocEntityConnectionCollections::Table)
            .column(MocEntityConnectionCollections::CollectionId)
            .and_where(
                Expr::col(MocEntityConnectionCollections::ConnectionId)
                    .eq(id_value(self.backend, connection_id)),
            )
            .and_where(Expr::col(MocEntityConnectionCollections::Deleted).eq(false))
            .to_owned();
        let mut linked = Vec::new();
        for row in query_all(conn, &select_links).await? {
            linked.push(read_id(&row, MocEntityConnectionCollections::CollectionId)?);
        }
        if linked.is_empty() {
            return Ok(HashSet::new());
        }

        let select_collections = Query::select()
            .from(MocCollections::Table)
            .columns([MocCollections::CollectionId, MocCollections::SourceId])
            .and_where(
                Expr::col(MocCollections::CollectionId)
                    .is_in(linked.iter().map(|id| id_value(self.backend, *id))),
            )
            .and_where(Expr::col(MocCollections::Published).eq(true))
            .and_where(Expr::col(MocCollections::Deleted).eq(false))
            .to_owned();
        let mut by_source: Vec<(Id, Id)> = Vec::new();
        for row in query_all(conn, &select_collections).await? {
            by_source.push((
                read_id(&row, MocCollections::CollectionId)?,
                read_id(&row, MocCollections::SourceId)?,
            ));
        }
        if by_source.is_empty() {
            return Ok(HashSet::new());
        }

        let select_sources = Query::select()
            .from(MocSources::Table)
            .column(MocSources::SourceId)
            .and_where(
                Expr::col(MocSources::SourceId)
                    .is_in(by_source.iter().map(|(_, s)| id_value(self.backend, *s))),
            )
            .and_where(Expr::col(MocSources::Active).eq(true))
            .to_owned();
        let mut active_sources = HashSet::new();
        for row in query_all(conn, &select_sources).await? {
            active_sources.insert(read_id(&row, MocSources::SourceId)?);
        }
        Ok(by_source
            .into_iter()
            .filter(|(_, source)| active_sources.contains(source))
            .map(|(collection, _)| CollectionId(collection))
            .collect())
    }

    async fn fetch_value_rows<C: ConnectionTrait>(
        &self,
        conn: &C,
        subject: SubjectRef,
        attribute_id: Option<Id>,
    ) -> MocResult<Vec<AttributeValueRow>> {
        let mut select = Query::select()
            .from(MocAttributeValues::Table)
            .columns([
                MocAttributeValues::AttributeValueId,
                MocAttributeValues::EntityId,
                MocAttributeValues::ConnectionId,
                MocAttributeValues::AttributeId,
                MocAttributeValues::ValueBoolean,
                MocAttributeValues::ValueInt,
                MocAttributeValues::ValueIntTo,
                MocAttributeValues::ValueFloat,
                MocAttributeValues::ValueFloatTo,
                MocAttributeValues::ValueString,
                MocAttributeValues::ValueText,
                MocAttributeValues::ValueDatetime,
                MocAttributeValues::ValueDatetimeTo,
                MocAttributeValues::ValueDate,
                MocAttributeValues::ValueDateTo,
                MocAttributeValues::CodebookValueId,
                MocAttributeValues::Currency,
                MocAttributeValues::ContentKey,
            ])
            .to_owned();
        match subject {
            SubjectRef::Entity(id) => {
                select.and_where(
                    Expr::col(MocAttributeValues::EntityId).eq(id_value(self.backend, id)),
                );
            }
            SubjectRef::Connection(id) => {
                select.and_where(
                    Expr::col(MocAttributeValues::ConnectionId).eq(id_value(self.backend, id)),
                );
            }
        }
        if let Some(attribute_id) = attribute_id {
            select.and_where(
                Expr::col(MocAttributeValues::AttributeId).eq(id_value(self.backend, attribute_id)),
            );
        }
        let mut rows = Vec::new();
        for row in query_all(conn, &select).await? {
            rows.push(read_value_row(&row)?);
        }
        Ok(rows)
    }

    async fn fetch_value_links<C: ConnectionTrait>(
        &self,
        conn: &C,
        value_ids: &[Id],
    ) -> MocResult<Vec<ValueLinkRow>> {
        if value_ids.is_empty() {
            return Ok(Vec::new());
        }
        let select = Query::select()
            .from(MocAttributeValueCollections::Table)
            .columns([
                MocAttributeValueCollections::LinkId,
                MocAttributeValueCollections::AttributeValueId,
                MocAttributeValueCollections::CollectionId,
                MocAttributeValueCollections::ValidFrom,
                MocAttributeValueCollections::ValidTo,
                MocAttributeValueCollections::CreatedAt,
                MocAttributeValueCollections::UpdatedAt,
            ])
            .and_where(
                Expr::col(MocAttributeValueCollections::AttributeValueId)
                    .is_in(value_ids.iter().map(|id| id_value(self.backend, *id))),
            )
            .to_owned();
        let mut links = Vec::new();
        for row in query_all(conn, &select).await? {
            links.push(ValueLinkRow {
                id: read_id(&row, MocAttributeValueCollections::LinkId)?,
                attribute_value_id: read_id(&row, MocAttributeValueCollections::AttributeValueId)?,
                collection_id: CollectionId(read_id(
                    &row,
                    MocAttributeValueCollections::CollectionId,
                )?),
                valid_from: read_date(&row, MocAttributeValueCollections::ValidFrom)?,
                valid_to: read_date(&row, MocAttributeValueCollections::ValidTo)?,
                created_at: Stamp(get(&row, MocAttributeValueCollections::CreatedAt)?),
                updated_at: Stamp(get(&row, MocAttributeValueCollections::UpdatedAt)?),
            });
        }
        Ok(links)
    }

    async fn fetch_connection_links<C: ConnectionTrait>(
        &self,
        conn: &C,
        connection_id: Id,
    ) -> MocResult<Vec<ConnectionLinkRow>> {
        let select = Query::select()
            .from(MocEntityConnectionCollections::Table)
            .columns([
                MocEntityConnectionCollections::LinkId,
                MocEntityConnectionCollections::ConnectionId,
                MocEntityConnectionCollections::CollectionId,
                MocEntityConnectionCollections::Deleted,
                MocEntityConnectionCollections::CreatedAt,
                MocEntityConnectionCollections::UpdatedAt,
            ])
            .and_where(
                Expr::col(MocEntityConnectionCollections::ConnectionId)
                    .eq(id_value(self.backend, connection_id)),
            )
            .to_owned();
        let mut links = Vec::new();
        for row in query_all(conn, &select).await? {
            links.push(ConnectionLinkRow {
                id: read_id(&row, MocEntityConnectionCollections::LinkId)?,
                connection_id: read_id(&row, MocEntityConnectionCollections::ConnectionId)?,
                collection_id: CollectionId(read_id(
                    &row,
                    MocEntityConnectionCollections::CollectionId,
                )?),
                deleted: get(&row, MocEntityConnectionCollections::Deleted)?,
                created_at: Stamp(get(&row, MocEntityConnectionCollections::CreatedAt)?),
                updated_at: Stamp(get(&row, MocEntityConnectionCollections::UpdatedAt)?),
            });
        }
        Ok(links)
    }

    async fn create_changeset<C: ConnectionTrait>(
        &self,
        conn: &C,
        collection_id: CollectionId,
    ) -> MocResult<(ChangesetId, Hlc)> {
        let changeset_id = ChangesetId(Id::new());
        let created_at = Hlc::now();
        let insert = Query::insert()
            .into_table(MocChangesets::Table)
            .columns([
                MocChangesets::ChangesetId,
                MocChangesets::CollectionId,
                MocChangesets::CreatedAtHlc,
            ])
            .values_panic([
                id_value(self.backend, changeset_id.0).into(),
                id_value(self.backend, collection_id.0).into(),
                created_at.as_i64().into(),
            ])
            .to_owned();
        exec(conn, &insert).await?;
        Ok((changeset_id, created_at))
    }

    async fn record_value_change<C: ConnectionTrait>(
        &self,
        conn: &C,
        changeset_id: ChangesetId,
        subject: SubjectRef,
        attribute_id: Id,
        change_type: ChangeType,
        old: Option<&ValueChangeSide>,
        new: Option<&ValueChangeSide>,
    ) -> MocResult<()> {
        let to_json = |side: Option<&ValueChangeSide>| -> MocResult<Option<String>> {
            side.map(|side| {
                serde_json::to_string(&side.value)
                    .map_err(|err| MocError::integrity(format!("serialize log value: {err}")))
            })
            .transpose()
        };
        let insert = Query::insert()
            .into_table(MocLogAttributeValueChanges::Table)
            .columns([
                MocLogAttributeValueChanges::LogId,
                MocLogAttributeValueChanges::ChangesetId,
                MocLogAttributeValueChanges::EntityId,
                MocLogAttributeValueChanges::ConnectionId,
                MocLogAttributeValueChanges::AttributeId,
                MocLogAttributeValueChanges::ChangeType,
                MocLogAttributeValueChanges::OldValue,
                MocLogAttributeValueChanges::NewValue,
                MocLogAttributeValueChanges::OldCurrency,
                MocLogAttributeValueChanges::NewCurrency,
                MocLogAttributeValueChanges::OldValidFrom,
                MocLogAttributeValueChanges::OldValidTo,
                MocLogAttributeValueChanges::NewValidFrom,
                MocLogAttributeValueChanges::NewValidTo,
                MocLogAttributeValueChanges::RecordedAtHlc,
            ])
            .values_panic([
                id_value(self.backend, Id::new()).into(),
                id_value(self.backend, changeset_id.0).into(),
                opt_id_value(self.backend, subject.entity_id()).into(),
                opt_id_value(self.backend, subject.connection_id()).into(),
                id_value(self.backend, attribute_id).into(),
                (change_type.as_i16() as i64).into(),
                to_json(old)?.into(),
                to_json(new)?.into(),
                old.and_then(|s| s.currency.as_ref().map(|c| c.as_str().to_string()))
                    .into(),
                new.and_then(|s| s.currency.as_ref().map(|c| c.as_str().to_string()))
                    .into(),
                date_text(old.and_then(|s| s.valid_from)).into(),
                date_text(old.and_then(|s| s.valid_to)).into(),
                date_text(new.and_then(|s| s.valid_from)).into(),
                date_text(new.and_then(|s| s.valid_to)).into(),
                Hlc::now().as_i64().into(),
            ])
            .to_owned();
        exec(conn, &insert).await
    }

    async fn record_connection_change<C: ConnectionTrait>(
        &self,
        conn: &C,
        changeset_id: ChangesetId,
        connection_id: Id,
        change_type: ChangeType,
        old: Option<&ConnectionState>,
        new: Option<&ConnectionState>,
    ) -> MocResult<()> {
        let to_json = |state: Option<&ConnectionState>| -> MocResult<Option<String>> {
            state
                .map(|state| {
                    serde_json::to_string(state).map_err(|err| {
                        MocError::integrity(format!("serialize connection state: {err}"))
                    })
                })
                .transpose()
        };
        let insert = Query::insert()
            .into_table(MocLogConnectionChanges::Table)
            .columns([
                MocLogConnectionChanges::LogId,
                MocLogConnectionChanges::ChangesetId,
                MocLogConnectionChanges::ConnectionId,
                MocLogConnectionChanges::ChangeType,
                MocLogConnectionChanges::OldState,
                MocLogConnectionChanges::NewState,
                MocLogConnectionChanges::RecordedAtHlc,
            ])
            .values_panic([
                id_value(self.backend, Id::new()).into(),
                id_value(self.backend, changeset_id.0).into(),
                id_value(self.backend, connection_id).into(),
                (change_type.as_i16() as i64).into(),
                to_json(old)?.into(),
                to_json(new)?.into(),
                Hlc::now().as_i64().into(),
            ])
            .to_owned();
        exec(conn, &insert).await
    }

    async fn insert_value_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        row: &AttributeValueRow,
    ) -> MocResult<()> {
        let slots = &row.slots;
        let insert = Query::insert()
            .into_table(MocAttributeValues::Table)
            .columns([
                MocAttributeValues::AttributeValueId,
                MocAttributeValues::EntityId,
                MocAttributeValues::ConnectionId,
                MocAttributeValues::AttributeId,
                MocAttributeValues::ValueBoolean,
                MocAttributeValues::ValueInt,
                MocAttributeValues::ValueIntTo,
                MocAttributeValues::ValueFloat,
                MocAttributeValues::ValueFloatTo,
                MocAttributeValues::ValueString,
                MocAttributeValues::ValueText,
                MocAttributeValues::ValueDatetime,
                MocAttributeValues::ValueDatetimeTo,
                MocAttributeValues::ValueDate,
                MocAttributeValues::ValueDateTo,
                MocAttributeValues::CodebookValueId,
                MocAttributeValues::Currency,
                MocAttributeValues::ContentKey,
            ])
            .values_panic([
                id_value(self.backend, row.id).into(),
                opt_id_value(self.backend, row.entity_id).into(),
                opt_id_value(self.backend, row.connection_id).into(),
                id_value(self.backend, row.attribute_id).into(),
                slots.value_boolean.into(),
                slots.value_int.into(),
                slots.value_int_to.into(),
                slots.value_float.into(),
                slots.value_float_to.into(),
                slots.value_string.clone().into(),
                slots.value_text.clone().into(),
                slots.value_datetime.into(),
                slots.value_datetime_to.into(),
                date_text(slots.value_date).into(),
                date_text(slots.value_date_to).into(),
                opt_id_value(self.backend, slots.codebook_value_id).into(),
                row.currency.as_ref().map(|c| c.as_str().to_string()).into(),
                row.content_key.clone().into(),
            ])
            .to_owned();
        exec(conn, &insert).await
    }

    async fn update_value_row_content<C: ConnectionTrait>(
        &self,
        conn: &C,
        value_id: Id,
        slots: &ValueSlots,
        currency: Option<&Currency>,
        content_key: &str,
    ) -> MocResult<()> {
        let update = Query::update()
            .table(MocAttributeValues::Table)
            .values([
                (MocAttributeValues::ValueBoolean, slots.value_boolean.into()),
                (MocAttributeValues::ValueInt, slots.value_int.into()),
                (MocAttributeValues::ValueIntTo, slots.value_int_to.into()),
                (MocAttributeValues::ValueFloat, slots.value_float.into()),
                (MocAttributeValues::ValueFloatTo, slots.value_float_to.into()),
                (
                    MocAttributeValues::ValueString,
                    slots.value_string.clone().into(),
                ),
                (MocAttributeValues::ValueText, slots.value_text.clone().into()),
                (MocAttributeValues::ValueDatetime, slots.value_datetime.into()),
                (
                    MocAttributeValues::ValueDatetimeTo,
                    slots.value_datetime_to.into(),
                ),
                (MocAttributeValues::ValueDate, date_text(slots.value_date).into()),
                (
                    MocAttributeValues::ValueDateTo,
                    date_text(slots.value_date_to).into(),
                ),
                (
                    MocAttributeValues::CodebookValueId,
                    opt_id_value(self.backend, slots.codebook_value_id).into(),
                ),
                (
                    MocAttributeValues::Currency,
                    currency.map(|c| c.as_str().to_string()).into(),
                ),
                (MocAttributeValues::ContentKey, content_key.to_string().into()),
            ])
            .and_where(
                Expr::col(MocAttributeValues::AttributeValueId)
                    .eq(id_value(self.backend, value_id)),
            )
            .to_owned();
        exec(conn, &update).await
    }

    async fn update_value_row_currency<C: ConnectionTrait>(
        &self,
        conn: &C,
        value_id: Id,
        currency: Option<&Currency>,
    ) -> MocResult<()> {
        let update = Query::update()
            .table(MocAttributeValues::Table)
            .values([(
                MocAttributeValues::Currency,
                currency.map(|c| c.as_str().to_string()).into(),
            )])
            .and_where(
                Expr::col(MocAttributeValues::AttributeValueId)
                    .eq(id_value(self.backend, value_id)),
            )
            .to_owned();
        exec(conn, &update).await
    }

    async fn delete_value_row<C: ConnectionTrait>(&self, conn: &C, value_id: Id) -> MocResult<()> {
        let delete = Query::delete()
            .from_table(MocAttributeValues::Table)
            .and_where(
                Expr::col(MocAttributeValues::AttributeValueId)
                    .eq(id_value(self.backend, value_id)),
            )
            .to_owned();
        exec(conn, &delete).await
    }

    async fn insert_value_link<C: ConnectionTrait>(
        &self,
        conn: &C,
        link: &ValueLinkRow,
    ) -> MocResult<()> {
        let insert = Query::insert()
            .into_table(MocAttributeValueCollections::Table)
            .columns([
                MocAttributeValueCollections::LinkId,
                MocAttributeValueCollections::AttributeValueId,
                MocAttributeValueCollections::CollectionId,
                MocAttributeValueCollections::ValidFrom,
                MocAttributeValueCollections::ValidTo,
                MocAttributeValueCollections::CreatedAt,
                MocAttributeValueCollections::UpdatedAt,
            ])
            .values_panic([
                id_value(self.backend, link.id).into(),
                id_value(self.backend, link.attribute_value_id).into(),
                id_value(self.backend, link.collection_id.0).into(),
                date_text(link.valid_from).into(),
                date_text(link.valid_to).into(),
                link.created_at.as_i64().into(),
                link.updated_at.as_i64().into(),
            ])
            .to_owned();
        exec(conn, &insert).await
    }

    async fn update_value_link<C: ConnectionTrait>(
        &self,
        conn: &C,
        link: &ValueLinkRow,
    ) -> MocResult<()> {
        let update = Query::update()
            .table(MocAttributeValueCollections::Table)
            .values([
                (
                    MocAttributeValueCollections::AttributeValueId,
                    id_value(self.backend, link.attribute_value_id).into(),
                ),
                (
                    MocAttributeValueCollections::ValidFrom,
                    date_text(link.valid_from).into(),
                ),
                (
                    MocAttributeValueCollections::ValidTo,
                    date_text(link.valid_to).into(),
                ),
                (
                    MocAttributeValueCollections::CreatedAt,
                    link.created_at.as_i64().into(),
                ),
                (
                    MocAttributeValueCollections::UpdatedAt,
                    link.updated_at.as_i64().into(),
                ),
            ])
            .and_where(
                Expr::col(MocAttributeValueCollections::LinkId)
                    .eq(id_value(self.backend, link.id)),
            )
            .to_owned();
        exec(conn, &update).await
    }

    async fn delete_value_link<C: ConnectionTrait>(&self, conn: &C, link_id: Id) -> MocResult<()> {
        let delete = Query::delete()
            .from_table(MocAttributeValueCollections::Table)
            .and_where(
                Expr::col(MocAttributeValueCollections::LinkId)
                    .eq(id_value(self.backend, link_id)),
            )
            .to_owned();
        exec(conn, &delete).await
    }

    /// Validate one ingestion claim against the schema graph and resolve
    /// the typed value. Runs before any write.
    async fn validate_value_claim<C: ConnectionTrait>(
        &self,
        conn: &C,
        graph: &SchemaGraph,
        input: &UpsertAttributeValueInput,
    ) -> MocResult<Value> {
        let spec = graph.type_of(input.attribute_id)?;
        if spec.data_type.is_composite() {
            return Err(MocError::schema(format!(
                "attribute type '{}' is complex; ingest its sub-attributes instead",
                spec.name
            )));
        }
        let value = codec::decode(&input.raw_value, spec, &self.format)?;
        if input.currency.is_some() && !spec.data_type.is_fixed_point() {
            return Err(MocError::schema(
                "currency is only valid for fixed-point kinds",
            ));
        }
        if let (Some(from), Some(to)) = (input.valid_from, input.valid_to) {
            if from > to {
                return Err(MocError::schema("valid_from is after valid_to"));
            }
        }

        let (_, _, collection_deleted) = self.fetch_collection(conn, input.collection_id).await?;
        if collection_deleted {
            return Err(MocError::schema(format!(
                "collection {} is deleted",
                input.collection_id
            )));
        }

        match input.subject {
            SubjectRef::Entity(entity_id) => {
                if !graph.is_entity_attribute(input.attribute_id)? {
                    return Err(MocError::schema(format!(
                        "attribute {} is not entity-scoped",
                        input.attribute_id
                    )));
                }
                let entity = self.fetch_entity(conn, entity_id).await?;
                if !graph.applies_to_entity_type(input.attribute_id, entity.entity_type_id)? {
                    return Err(MocError::schema(format!(
                        "attribute {} does not apply to entity type {}",
                        input.attribute_id, entity.entity_type_id
                    )));
                }
            }
            SubjectRef::Connection(connection_id) => {
                if !graph.is_connection_attribute(input.attribute_id)? {
                    return Err(MocError::schema(format!(
                        "attribute {} is not connection-scoped",
                        input.attribute_id
                    )));
                }
                let row = self
                    .fetch_connection_row(conn, connection_id)
                    .await?
                    .ok_or_else(|| MocError::not_found(format!("connection {connection_id}")))?;
                let active = self.active_collections(conn, row.id).await?;
                if !graph.applies_to_collections(input.attribute_id, &active)? {
                    return Err(MocError::schema(format!(
                        "attribute {} does not apply to connection {}",
                        input.attribute_id, connection_id
                    )));
                }
            }
        }

        if let Value::Codebook(value_id) = value {
            let spec_codebook = spec.codebook_id.ok_or_else(|| {
                MocError::integrity(format!(
                    "attribute type '{}' is codebook-kinded but has no codebook",
                    spec.name
                ))
            })?;
            let select = Query::select()
                .from(MocCodebookValues::Table)
                .column(MocCodebookValues::CodebookId)
                .and_where(
                    Expr::col(MocCodebookValues::CodebookValueId)
                        .eq(id_value(self.backend, value_id)),
                )
                .to_owned();
            let row = query_one(conn, &select)
                .await?
                .ok_or_else(|| MocError::format(format!("unknown codebook value {value_id}")))?;
            let owner = read_id(&row, MocCodebookValues::CodebookId)?;
            if owner != spec_codebook {
                return Err(MocError::format(format!(
                    "codebook value {value_id} belongs to a different codebook"
                )));
            }
        }

        Ok(value)
    }

    async fn find_exact_connections<C: ConnectionTrait>(
        &self,
        conn: &C,
        peers: &ConnectionPeers,
        valid_from: Option<NaiveDate>,
        valid_to: Option<NaiveDate>,
        transaction: Option<&TransactionInfo>,
        exclude: Option<Id>,
    ) -> MocResult<Vec<ConnectionRecord>> {
        // Candidates by unordered pair + type; window and transaction
        // equality (nulls included) is checked in memory.
        let select = connection_select()
            .and_where(
                Expr::col(MocEntityConnections::ConnectionTypeId)
                    .eq(id_value(self.backend, peers.connection_type_id)),
            )
            .cond_where(
                Cond::any()
                    .add(
                        Cond::all()
                            .add(
                                Expr::col(MocEntityConnections::EntityAId)
                                    .eq(id_value(self.backend, peers.entity_a)),
                            )
                            .add(
                                Expr::col(MocEntityConnections::EntityBId)
                                    .eq(id_value(self.backend, peers.entity_b)),
                            ),
                    )
                    .add(
                        Cond::all()
                            .add(
                                Expr::col(MocEntityConnections::EntityAId)
                                    .eq(id_value(self.backend, peers.entity_b)),
                            )
                            .add(
                                Expr::col(MocEntityConnections::EntityBId)
                                    .eq(id_value(self.backend, peers.entity_a)),
                            ),
                    ),
            )
            .to_owned();
        let mut matches = Vec::new();
        for row in query_all(conn, &select).await? {
            let record = read_connection_record(&row)?;
            if Some(record.id) == exclude {
                continue;
            }
            if record.valid_from == valid_from
                && record.valid_to == valid_to
                && record.transaction.as_ref() == transaction
            {
                matches.push(record);
            }
        }
        Ok(matches)
    }

    async fn insert_connection_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        record: &ConnectionRecord,
    ) -> MocResult<()> {
        let insert = Query::insert()
            .into_table(MocEntityConnections::Table)
            .columns([
                MocEntityConnections::ConnectionId,
                MocEntityConnections::EntityAId,
                MocEntityConnections::EntityBId,
                MocEntityConnections::ConnectionTypeId,
                MocEntityConnections::ValidFrom,
                MocEntityConnections::ValidTo,
                MocEntityConnections::TxAmount,
                MocEntityConnections::TxCurrency,
                MocEntityConnections::TxDate,
                MocEntityConnections::Deleted,
                MocEntityConnections::Published,
            ])
            .values_panic([
                id_value(self.backend, record.id).into(),
                id_value(self.backend, record.entity_a).into(),
                id_value(self.backend, record.entity_b).into(),
                id_value(self.backend, record.connection_type_id).into(),
                date_text(record.valid_from).into(),
                date_text(record.valid_to).into(),
                record.transaction.as_ref().map(|t| t.amount).into(),
                record
                    .transaction
                    .as_ref()
                    .map(|t| t.currency.as_str().to_string())
                    .into(),
                date_text(record.transaction.as_ref().map(|t| t.date)).into(),
                record.deleted.into(),
                record.published.into(),
            ])
            .to_owned();
        exec(conn, &insert).await
    }

    async fn set_connection_flags<C: ConnectionTrait>(
        &self,
        conn: &C,
        connection_id: Id,
        deleted: bool,
        published: bool,
    ) -> MocResult<()> {
        let update = Query::update()
            .table(MocEntityConnections::Table)
            .values([
                (MocEntityConnections::Deleted, deleted.into()),
                (MocEntityConnections::Published, published.into()),
            ])
            .and_where(
                Expr::col(MocEntityConnections::ConnectionId)
                    .eq(id_value(self.backend, connection_id)),
            )
            .to_owned();
        exec(conn, &update).await
    }

    async fn update_connection_window<C: ConnectionTrait>(
        &self,
        conn: &C,
        connection_id: Id,
        valid_from: Option<NaiveDate>,
        valid_to: Option<NaiveDate>,
        transaction: Option<&TransactionInfo>,
    ) -> MocResult<()> {
        let update = Query::update()
            .table(MocEntityConnections::Table)
            .values([
                (MocEntityConnections::ValidFrom, date_text(valid_from).into()),
                (MocEntityConnections::ValidTo, date_text(valid_to).into()),
                (
                    MocEntityConnections::TxAmount,
                    transaction.map(|t| t.amount).into(),
                ),
                (
                    MocEntityConnections::TxCurrency,
                    transaction.map(|t| t.currency.as_str().to_string()).into(),
                ),
                (
                    MocEntityConnections::TxDate,
                    date_text(transaction.map(|t| t.date)).into(),
                ),
            ])
            .and_where(
                Expr::col(MocEntityConnections::ConnectionId)
                    .eq(id_value(self.backend, connection_id)),
            )
            .to_owned();
        exec(conn, &update).await
    }

    /// Make sure `collection` holds an active link to `connection`; reuse
    /// and undelete an existing link when there is one.
    async fn ensure_connection_link<C: ConnectionTrait>(
        &self,
        conn: &C,
        connection_id: Id,
        collection_id: CollectionId,
    ) -> MocResult<ConnectionLinkRow> {
        let links = self.fetch_connection_links(conn, connection_id).await?;
        if let Some(mut link) = links
            .into_iter()
            .find(|link| link.collection_id == collection_id)
        {
            if link.deleted {
                link.deleted = false;
                link.updated_at = Stamp::now();
                self.update_connection_link(conn, &link).await?;
            }
            return Ok(link);
        }
        let now = Stamp::now();
        let link = ConnectionLinkRow {
            id: Id::new(),
            connection_id,
            collection_id,
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        let insert = Query::insert()
            .into_table(MocEntityConnectionCollections::Table)
            .columns([
                MocEntityConnectionCollections::LinkId,
                MocEntityConnectionCollections::ConnectionId,
                MocEntityConnectionCollections::CollectionId,
                MocEntityConnectionCollections::Deleted,
                MocEntityConnectionCollections::CreatedAt,
                MocEntityConnectionCollections::UpdatedAt,
            ])
            .values_panic([
                id_value(self.backend, link.id).into(),
                id_value(self.backend, link.connection_id).into(),
                id_value(self.backend, link.collection_id.0).into(),
                link.deleted.into(),
                link.created_at.as_i64().into(),
                link.updated_at.as_i64().into(),
            ])
            .to_owned();
        exec(conn, &insert).await?;
        Ok(link)
    }

    async fn update_connection_link<C: ConnectionTrait>(
        &self,
        conn: &C,
        link: &ConnectionLinkRow,
    ) -> MocResult<()> {
        let update = Query::update()
            .table(MocEntityConnectionCollections::Table)
            .values([
                (
                    MocEntityConnectionCollections::ConnectionId,
                    id_value(self.backend, link.connection_id).into(),
                ),
                (MocEntityConnectionCollections::Deleted, link.deleted.into()),
                (
                    MocEntityConnectionCollections::CreatedAt,
                    link.created_at.as_i64().into(),
                ),
                (
                    MocEntityConnectionCollections::UpdatedAt,
                    link.updated_at.as_i64().into(),
                ),
            ])
            .and_where(
                Expr::col(MocEntityConnectionCollections::LinkId)
                    .eq(id_value(self.backend, link.id)),
            )
            .to_owned();
        exec(conn, &update).await
    }

    async fn delete_connection_link<C: ConnectionTrait>(
        &self,
        conn: &C,
        link_id: Id,
    ) -> MocResult<()> {
        let delete = Query::delete()
            .from_table(MocEntityConnectionCollections::Table)
            .and_where(
                Expr::col(MocEntityConnectionCollections::LinkId)
                    .eq(id_value(self.backend, link_id)),
            )
            .to_owned();
        exec(conn, &delete).await
    }

    /// Identity migration: move every dependent of `old` onto `survivor`,
    /// merging where the survivor already carries an equivalent value, then
    /// delete the orphaned row. Merged provenance keeps the earliest
    /// created_at and the latest updated_at of the two histories.
    async fn migrate_connection_dependents<C: ConnectionTrait>(
        &self,
        conn: &C,
        old: &ConnectionRecord,
        survivor: &ConnectionRecord,
    ) -> MocResult<()> {
        debug!(old = %old.id, survivor = %survivor.id, "connection identity migration");
        let old_rows = self
            .fetch_value_rows(conn, SubjectRef::Connection(old.id), None)
            .await?;
        let survivor_rows = self
            .fetch_value_rows(conn, SubjectRef::Connection(survivor.id), None)
            .await?;
        let old_links = self
            .fetch_value_links(conn, &old_rows.iter().map(|r| r.id).collect::<Vec<_>>())
            .await?;
        let survivor_links = self
            .fetch_value_links(
                conn,
                &survivor_rows.iter().map(|r| r.id).collect::<Vec<_>>(),
            )
            .await?;

        for row in &old_rows {
            let equivalent = survivor_rows
                .iter()
                .find(|s| s.attribute_id == row.attribute_id && s.content_key == row.content_key);
            match equivalent {
                Some(target) => {
                    for link in old_links.iter().filter(|l| l.attribute_value_id == row.id) {
                        let twin = survivor_links.iter().find(|l| {
                            l.attribute_value_id == target.id
                                && l.collection_id == link.collection_id
                        });
                        match twin {
                            Some(twin) => {
                                let mut merged = twin.clone();
                                merged.created_at = twin.created_at.min(link.created_at);
                                merged.updated_at = twin.updated_at.max(link.updated_at);
                                self.update_value_link(conn, &merged).await?;
                                self.delete_value_link(conn, link.id).await?;
                            }
                            None => {
                                let mut moved = link.clone();
                                moved.attribute_value_id = target.id;
                                self.update_value_link(conn, &moved).await?;
                            }
                        }
                    }
                    self.delete_value_row(conn, row.id).await?;
                }
                None => {
                    let transplant = Query::update()
                        .table(MocAttributeValues::Table)
                        .values([(
                            MocAttributeValues::ConnectionId,
                            id_value(self.backend, survivor.id).into(),
                        )])
                        .and_where(
                            Expr::col(MocAttributeValues::AttributeValueId)
                                .eq(id_value(self.backend, row.id)),
                        )
                        .to_owned();
                    exec(conn, &transplant).await?;
                }
            }
        }

        // Log rows follow their subject to the surviving connection.
        let relink_value_logs = Query::update()
            .table(MocLogAttributeValueChanges::Table)
            .values([(
                MocLogAttributeValueChanges::ConnectionId,
                id_value(self.backend, survivor.id).into(),
            )])
            .and_where(
                Expr::col(MocLogAttributeValueChanges::ConnectionId)
                    .eq(id_value(self.backend, old.id)),
            )
            .to_owned();
        exec(conn, &relink_value_logs).await?;
        let relink_connection_logs = Query::update()
            .table(MocLogConnectionChanges::Table)
            .values([(
                MocLogConnectionChanges::ConnectionId,
                id_value(self.backend, survivor.id).into(),
            )])
            .and_where(
                Expr::col(MocLogConnectionChanges::ConnectionId)
                    .eq(id_value(self.backend, old.id)),
            )
            .to_owned();
        exec(conn, &relink_connection_logs).await?;

        // Collection links: merge stamps where the survivor is already
        // linked, otherwise re-point.
        let old_conn_links = self.fetch_connection_links(conn, old.id).await?;
        let survivor_conn_links = self.fetch_connection_links(conn, survivor.id).await?;
        for link in old_conn_links {
            let twin = survivor_conn_links
                .iter()
                .find(|l| l.collection_id == link.collection_id);
            match twin {
                Some(twin) => {
                    let mut merged = twin.clone();
                    merged.created_at = twin.created_at.min(link.created_at);
                    merged.updated_at = twin.updated_at.max(link.updated_at);
                    merged.deleted = twin.deleted && link.deleted;
                    self.update_connection_link(conn, &merged).await?;
                    self.delete_connection_link(conn, link.id).await?;
                }
                None => {
                    let mut moved = link;
                    moved.connection_id = survivor.id;
                    self.update_connection_link(conn, &moved).await?;
                }
            }
        }

        let delete_old = Query::delete()
            .from_table(MocEntityConnections::Table)
            .and_where(
                Expr::col(MocEntityConnections::ConnectionId).eq(id_value(self.backend, old.id)),
            )
            .to_owned();
        exec(conn, &delete_old).await
    }
}

#[async_trait]
impl SchemaAdminApi for MocStore {
    async fn upsert_schema_batch(&self, batch: SchemaBatch) -> MocResult<()> {
        for spec in &batch.attribute_types {
            spec.validate()?;
        }
        for attribute in &batch.attributes {
            attribute.owner()?;
        }
        let tx = self.conn.begin().await.map_err(db_err)?;

        for def in &batch.entity_types {
            upsert_named(
                &tx,
                self.backend,
                MocEntityTypes::Table,
                MocEntityTypes::EntityTypeId,
                MocEntityTypes::Name,
                def.id,
                &def.name,
            )
            .await?;
        }
        for def in &batch.connection_types {
            upsert_named(
                &tx,
                self.backend,
                MocConnectionTypes::Table,
                MocConnectionTypes::ConnectionTypeId,
                MocConnectionTypes::Name,
                def.id,
                &def.name,
            )
            .await?;
        }
        for def in &batch.sources {
            let insert = Query::insert()
                .into_table(MocSources::Table)
                .columns([MocSources::SourceId, MocSources::Name, MocSources::Active])
                .values_panic([
                    id_value(self.backend, def.id).into(),
                    def.name.clone().into(),
                    def.active.into(),
                ])
                .on_conflict(
                    OnConflict::column(MocSources::SourceId)
                        .update_columns([MocSources::Name, MocSources::Active])
                        .to_owned(),
                )
                .to_owned();
            exec(&tx, &insert).await?;
        }
        for def in &batch.collections {
            let insert = Query::insert()
                .into_table(MocCollections::Table)
                .columns([
                    MocCollections::CollectionId,
                    MocCollections::SourceId,
                    MocCollections::Name,
                    MocCollections::Published,
                    MocCollections::Deleted,
                ])
                .values_panic([
                    id_value(self.backend, def.id.0).into(),
                    id_value(self.backend, def.source_id).into(),
                    def.name.clone().into(),
                    def.published.into(),
                    def.deleted.into(),
                ])
                .on_conflict(
                    OnConflict::column(MocCollections::CollectionId)
                        .update_columns([
                            MocCollections::SourceId,
                            MocCollections::Name,
                            MocCollections::Published,
                            MocCollections::Deleted,
                        ])
                        .to_owned(),
                )
                .to_owned();
            exec(&tx, &insert).await?;
        }
        for def in &batch.codebooks {
            upsert_named(
                &tx,
                self.backend,
                MocCodebooks::Table,
                MocCodebooks::CodebookId,
                MocCodebooks::Name,
                def.id,
                &def.name,
            )
            .await?;
        }
        for def in &batch.codebook_values {
            let insert = Query::insert()
                .into_table(MocCodebookValues::Table)
                .columns([
                    MocCodebookValues::CodebookValueId,
                    MocCodebookValues::CodebookId,
                    MocCodebookValues::Label,
                ])
                .values_panic([
                    id_value(self.backend, def.id).into(),
                    id_value(self.backend, def.codebook_id).into(),
                    def.label.clone().into(),
                ])
                .on_conflict(
                    OnConflict::column(MocCodebookValues::CodebookValueId)
                        .update_columns([MocCodebookValues::CodebookId, MocCodebookValues::Label])
                        .to_owned(),
                )
                .to_owned();
            exec(&tx, &insert).await?;
        }
        for spec in &batch.attribute_types {
            let insert = Query::insert()
                .into_table(MocAttributeTypes::Table)
                .columns([
                    MocAttributeTypes::AttributeTypeId,
                    MocAttributeTypes::Name,
                    MocAttributeTypes::DataType,
                    MocAttributeTypes::DecimalPlaces,
                    MocAttributeTypes::CodebookId,
                    MocAttributeTypes::FromInclusive,
                    MocAttributeTypes::ToInclusive,
                ])
                .values_panic([
                    id_value(self.backend, spec.id).into(),
                    spec.name.clone().into(),
                    (spec.data_type.as_i16() as i64).into(),
                    spec.decimal_places.map(|v| v as i32).into(),
                    opt_id_value(self.backend, spec.codebook_id).into(),
                    spec.from_inclusive.into(),
                    spec.to_inclusive.into(),
                ])
                .on_conflict(
                    OnConflict::column(MocAttributeTypes::AttributeTypeId)
                        .update_columns([
                            MocAttributeTypes::Name,
                            MocAttributeTypes::DataType,
                            MocAttributeTypes::DecimalPlaces,
                            MocAttributeTypes::CodebookId,
                            MocAttributeTypes::FromInclusive,
                            MocAttributeTypes::ToInclusive,
                        ])
                        .to_owned(),
                )
                .to_owned();
            exec(&tx, &insert).await?;
        }
        for attribute in &batch.attributes {
            let insert = Query::insert()
                .into_table(MocAttributes::Table)
                .columns([
                    MocAttributes::AttributeId,
                    MocAttributes::Name,
                    MocAttributes::AttributeTypeId,
                    MocAttributes::EntityTypeId,
                    MocAttributes::CollectionId,
                    MocAttributes::ParentAttributeId,
                ])
                .values_panic([
                    id_value(self.backend, attribute.id).into(),
                    attribute.name.clone().into(),
                    id_value(self.backend, attribute.attribute_type_id).into(),
                    opt_id_value(self.backend, attribute.entity_type_id).into(),
                    opt_id_value(self.backend, attribute.collection_id.map(|c| c.0)).into(),
                    opt_id_value(self.backend, attribute.parent_id).into(),
                ])
                .on_conflict(
                    OnConflict::column(MocAttributes::AttributeId)
                        .update_columns([
                            MocAttributes::Name,
                            MocAttributes::AttributeTypeId,
                            MocAttributes::EntityTypeId,
                            MocAttributes::CollectionId,
                            MocAttributes::ParentAttributeId,
                        ])
                        .to_owned(),
                )
                .to_owned();
            exec(&tx, &insert).await?;
        }

        // Whole-graph validation after the writes; an error rolls the
        // batch back.
        let graph = self.load_schema_graph(&tx).await?;
        for attribute in &batch.attributes {
            let def = graph.attribute(attribute.id)?;
            graph.validate_attribute(def)?;
            graph.root_of(attribute.id)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn register_entity(&self, name: &str, entity_type_id: Id) -> MocResult<EntityRecord> {
        let tx = self.conn.begin().await.map_err(db_err)?;
        let base = slugify(name);
        let mut public_id = base.clone();
        let mut counter = 1u32;
        loop {
            let select = Query::select()
                .from(MocEntities::Table)
                .column(MocEntities::EntityId)
                .and_where(Expr::col(MocEntities::PublicId).eq(public_id.clone()))
                .to_owned();
            if query_one(&tx, &select).await?.is_none() {
                break;
            }
            counter += 1;
            public_id = format!("{base}-{counter}");
        }
        let record = EntityRecord {
            id: Id::new(),
            public_id,
            entity_type_id,
            deleted: false,
        };
        let insert = Query::insert()
            .into_table(MocEntities::Table)
            .columns([
                MocEntities::EntityId,
                MocEntities::PublicId,
                MocEntities::EntityTypeId,
                MocEntities::Deleted,
            ])
            .values_panic([
                id_value(self.backend, record.id).into(),
                record.public_id.clone().into(),
                id_value(self.backend, record.entity_type_id).into(),
                false.into(),
            ])
            .to_owned();
        exec(&tx, &insert).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn resolve_codebook_value(
        &self,
        codebook_id: Id,
        value_id: Id,
    ) -> MocResult<CodebookValueRecord> {
        let select = Query::select()
            .from(MocCodebookValues::Table)
            .columns([
                MocCodebookValues::CodebookValueId,
                MocCodebookValues::CodebookId,
                MocCodebookValues::Label,
            ])
            .and_where(
                Expr::col(MocCodebookValues::CodebookValueId).eq(id_value(self.backend, value_id)),
            )
            .to_owned();
        let row = query_one(&self.conn, &select)
            .await?
            .ok_or_else(|| MocError::not_found(format!("codebook value {value_id}")))?;
        let record = CodebookValueRecord {
            id: read_id(&row, MocCodebookValues::CodebookValueId)?,
            codebook_id: read_id(&row, MocCodebookValues::CodebookId)?,
            label: get(&row, MocCodebookValues::Label)?,
        };
        if record.codebook_id != codebook_id {
            return Err(MocError::format(format!(
                "codebook value {value_id} belongs to a different codebook"
            )));
        }
        Ok(record)
    }
}

#[async_trait]
impl IngestApi for MocStore {
    async fn upsert_attribute_value(
        &self,
        input: UpsertAttributeValueInput,
    ) -> MocResult<ValueLink> {
        let tx = self.conn.begin().await.map_err(db_err)?;
        let graph = self.load_schema_graph(&tx).await?;
        let value = self.validate_value_claim(&tx, &graph, &input).await?;
        let slots = value.to_slots();
        let content_key = slots.content_key();

        let value_rows = self
            .fetch_value_rows(&tx, input.subject, Some(input.attribute_id))
            .await?;
        let links = self
            .fetch_value_links(&tx, &value_rows.iter().map(|r| r.id).collect::<Vec<_>>())
            .await?;
        let existing_link = links
            .iter()
            .find(|link| link.collection_id == input.collection_id)
            .cloned();

        let link = match existing_link {
            Some(link) => {
                self.reassert_value(
                    &tx,
                    &input,
                    &value,
                    &slots,
                    &content_key,
                    &value_rows,
                    &links,
                    link,
                )
                .await?
            }
            None => {
                self.first_assert_value(&tx, &input, &value, &slots, &content_key, &value_rows)
                    .await?
            }
        };
        tx.commit().await.map_err(db_err)?;
        Ok(ValueLink {
            id: link.id,
            attribute_value_id: link.attribute_value_id,
            collection_id: link.collection_id,
            valid_from: link.valid_from,
            valid_to: link.valid_to,
            created_at: link.created_at,
            updated_at: link.updated_at,
        })
    }

    async fn upsert_connection(&self, input: UpsertConnectionInput) -> MocResult<ConnectionLink> {
        input.validate()?;
        let tx = self.conn.begin().await.map_err(db_err)?;
        let (_, _, collection_deleted) = self.fetch_collection(&tx, input.collection_id).await?;
        if collection_deleted {
            return Err(MocError::schema(format!(
                "collection {} is deleted",
                input.collection_id
            )));
        }

        let link = if let Some(peers) = &input.peers {
            self.upsert_new_connection(&tx, &input, peers).await?
        } else {
            let connection_id = input
                .update_connection
                .ok_or_else(|| MocError::schema("update_connection is required on this path"))?;
            self.revalidate_connection(&tx, &input, connection_id)
                .await?
        };
        tx.commit().await.map_err(db_err)?;
        Ok(ConnectionLink {
            id: link.id,
            connection_id: link.connection_id,
            collection_id: link.collection_id,
            created_at: link.created_at,
            updated_at: link.updated_at,
        })
    }

    async fn soft_delete_connection(
        &self,
        connection_id: Id,
        collection_id: CollectionId,
    ) -> MocResult<()> {
        let tx = self.conn.begin().await.map_err(db_err)?;
        self.fetch_collection(&tx, collection_id).await?;
        let row = self
            .fetch_connection_row(&tx, connection_id)
            .await?
            .ok_or_else(|| MocError::not_found(format!("connection {connection_id}")))?;
        if row.deleted {
            return Ok(());
        }
        let old_state = connection_state_of(&row);
        self.set_connection_flags(&tx, row.id, true, false).await?;
        let mut retired = row;
        retired.deleted = true;
        retired.published = false;
        let (changeset_id, _) = self.create_changeset(&tx, collection_id).await?;
        self.record_connection_change(
            &tx,
            changeset_id,
            retired.id,
            ChangeType::Update,
            Some(&old_state),
            Some(&connection_state_of(&retired)),
        )
        .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}

impl MocStore {
    /// A collection re-asserting a value for a subject+attribute it has
    /// already claimed.
    #[allow(clippy::too_many_arguments)]
    async fn reassert_value<C: ConnectionTrait>(
        &self,
        conn: &C,
        input: &UpsertAttributeValueInput,
        value: &Value,
        slots: &ValueSlots,
        content_key: &str,
        value_rows: &[AttributeValueRow],
        links: &[ValueLinkRow],
        existing_link: ValueLinkRow,
    ) -> MocResult<ValueLinkRow> {
        let current_row = value_rows
            .iter()
            .find(|row| row.id == existing_link.attribute_value_id)
            .ok_or_else(|| MocError::integrity("collection link points at a vanished value row"))?;

        if current_row.content_key == content_key {
            let window_changed = existing_link.valid_from != input.valid_from
                || existing_link.valid_to != input.valid_to;
            let currency_changed = current_row.currency != input.currency;
            if !window_changed && !currency_changed {
                debug!(attribute = %input.attribute_id, "idempotent re-assertion, no-op");
                return Ok(existing_link);
            }
            let old_side = ValueChangeSide {
                value: Value::from_slots(value.data_type(), &current_row.slots)?,
                currency: current_row.currency.clone(),
                valid_from: existing_link.valid_from,
                valid_to: existing_link.valid_to,
            };
            let mut updated = existing_link.clone();
            updated.valid_from = input.valid_from;
            updated.valid_to = input.valid_to;
            updated.updated_at = Stamp::now();
            self.update_value_link(conn, &updated).await?;
            if currency_changed {
                self.update_value_row_currency(conn, current_row.id, input.currency.as_ref())
                    .await?;
            }
            let new_side = ValueChangeSide {
                value: value.clone(),
                currency: input.currency.clone(),
                valid_from: input.valid_from,
                valid_to: input.valid_to,
            };
            let (changeset_id, _) = self.create_changeset(conn, input.collection_id).await?;
            self.record_value_change(
                conn,
                changeset_id,
                input.subject,
                input.attribute_id,
                ChangeType::Update,
                Some(&old_side),
                Some(&new_side),
            )
            .await?;
            return Ok(updated);
        }

        // Content changed: keep at most one canonical row per content.
        let old_side = ValueChangeSide {
            value: Value::from_slots(value.data_type(), &current_row.slots)?,
            currency: current_row.currency.clone(),
            valid_from: existing_link.valid_from,
            valid_to: existing_link.valid_to,
        };
        let exclusively_owned = !links
            .iter()
            .any(|l| l.attribute_value_id == current_row.id && l.id != existing_link.id);
        let match_row = value_rows
            .iter()
            .find(|row| row.id != current_row.id && row.content_key == content_key);

        let mut updated = existing_link.clone();
        updated.valid_from = input.valid_from;
        updated.valid_to = input.valid_to;
        updated.updated_at = Stamp::now();

        match match_row {
            Some(target) => {
                debug!(attribute = %input.attribute_id, target = %target.id, "relinking to matching canonical row");
                updated.attribute_value_id = target.id;
                self.update_value_link(conn, &updated).await?;
                if target.currency != input.currency {
                    self.update_value_row_currency(conn, target.id, input.currency.as_ref())
                        .await?;
                }
                if exclusively_owned {
                    self.delete_value_row(conn, current_row.id).await?;
                }
            }
            None if exclusively_owned => {
                debug!(attribute = %input.attribute_id, row = %current_row.id, "updating exclusively-owned row in place");
                self.update_value_row_content(
                    conn,
                    current_row.id,
                    slots,
                    input.currency.as_ref(),
                    content_key,
                )
                .await?;
                self.update_value_link(conn, &updated).await?;
            }
            None => {
                debug!(attribute = %input.attribute_id, "splitting off a new canonical row");
                let new_row = AttributeValueRow {
                    id: Id::new(),
                    entity_id: input.subject.entity_id(),
                    connection_id: input.subject.connection_id(),
                    attribute_id: input.attribute_id,
                    slots: slots.clone(),
                    currency: input.currency.clone(),
                    content_key: content_key.to_string(),
                };
                self.insert_value_row(conn, &new_row).await?;
                updated.attribute_value_id = new_row.id;
                self.update_value_link(conn, &updated).await?;
            }
        }

        let new_side = ValueChangeSide {
            value: value.clone(),
            currency: input.currency.clone(),
            valid_from: input.valid_from,
            valid_to: input.valid_to,
        };
        let (changeset_id, _) = self.create_changeset(conn, input.collection_id).await?;
        self.record_value_change(
            conn,
            changeset_id,
            input.subject,
            input.attribute_id,
            ChangeType::Update,
            Some(&old_side),
            Some(&new_side),
        )
        .await?;
        Ok(updated)
    }

    /// First assertion by this collection for the subject+attribute.
    async fn first_assert_value<C: ConnectionTrait>(
        &self,
        conn: &C,
        input: &UpsertAttributeValueInput,
        value: &Value,
        slots: &ValueSlots,
        content_key: &str,
        value_rows: &[AttributeValueRow],
    ) -> MocResult<ValueLinkRow> {
        let (value_id, created) = match value_rows
            .iter()
            .find(|row| row.content_key == content_key)
        {
            Some(row) => {
                debug!(attribute = %input.attribute_id, row = %row.id, "reusing canonical row from another source");
                (row.id, false)
            }
            None => {
                let row = AttributeValueRow {
                    id: Id::new(),
                    entity_id: input.subject.entity_id(),
                    connection_id: input.subject.connection_id(),
                    attribute_id: input.attribute_id,
                    slots: slots.clone(),
                    currency: input.currency.clone(),
                    content_key: content_key.to_string(),
                };
                self.insert_value_row(conn, &row).await?;
                (row.id, true)
            }
        };
        let now = Stamp::now();
        let link = ValueLinkRow {
            id: Id::new(),
            attribute_value_id: value_id,
            collection_id: input.collection_id,
            valid_from: input.valid_from,
            valid_to: input.valid_to,
            created_at: now,
            updated_at: now,
        };
        self.insert_value_link(conn, &link).await?;

        let new_side = ValueChangeSide {
            value: value.clone(),
            currency: input.currency.clone(),
            valid_from: input.valid_from,
            valid_to: input.valid_to,
        };
        let change_type = if created {
            ChangeType::Create
        } else {
            ChangeType::Update
        };
        let (changeset_id, _) = self.create_changeset(conn, input.collection_id).await?;
        self.record_value_change(
            conn,
            changeset_id,
            input.subject,
            input.attribute_id,
            change_type,
            None,
            Some(&new_side),
        )
        .await?;
        Ok(link)
    }

    async fn upsert_new_connection<C: ConnectionTrait>(
        &self,
        conn: &C,
        input: &UpsertConnectionInput,
        peers: &ConnectionPeers,
    ) -> MocResult<ConnectionLinkRow> {
        self.fetch_entity(conn, peers.entity_a).await?;
        self.fetch_entity(conn, peers.entity_b).await?;

        let exact = self
            .find_exact_connections(
                conn,
                peers,
                input.valid_from,
                input.valid_to,
                input.transaction.as_ref(),
                None,
            )
            .await?;
        let (record, created) = match exact.into_iter().next() {
            Some(mut record) => {
                if record.deleted || !record.published {
                    self.set_connection_flags(conn, record.id, false, true)
                        .await?;
                    record.deleted = false;
                    record.published = true;
                }
                debug!(connection = %record.id, "reusing exact connection match");
                (record, false)
            }
            None => {
                let record = ConnectionRecord {
                    id: Id::new(),
                    entity_a: peers.entity_a,
                    entity_b: peers.entity_b,
                    connection_type_id: peers.connection_type_id,
                    valid_from: input.valid_from,
                    valid_to: input.valid_to,
                    transaction: input.transaction.clone(),
                    deleted: false,
                    published: true,
                };
                self.insert_connection_row(conn, &record).await?;
                (record, true)
            }
        };

        let link = self
            .ensure_connection_link(conn, record.id, input.collection_id)
            .await?;
        let state = connection_state_of(&record);
        let (changeset_id, _) = self.create_changeset(conn, input.collection_id).await?;
        if created {
            self.record_connection_change(
                conn,
                changeset_id,
                record.id,
                ChangeType::Create,
                None,
                Some(&state),
            )
            .await?;
        } else {
            self.record_connection_change(
                conn,
                changeset_id,
                record.id,
                ChangeType::Update,
                Some(&state),
                Some(&state),
            )
            .await?;
        }
        Ok(link)
    }

    /// Update-connection path: re-validate an existing connection's window
    /// under a possibly-different collection.
    async fn revalidate_connection<C: ConnectionTrait>(
        &self,
        conn: &C,
        input: &UpsertConnectionInput,
        connection_id: Id,
    ) -> MocResult<ConnectionLinkRow> {
        let row = self
            .fetch_connection_row(conn, connection_id)
            .await?
            .ok_or_else(|| MocError::not_found(format!("connection {connection_id}")))?;
        if row.deleted {
            return Err(MocError::conflict(format!(
                "connection {connection_id} is deleted; re-assert it before updating"
            )));
        }

        if row.valid_from == input.valid_from && row.valid_to == input.valid_to {
            return self
                .ensure_connection_link(conn, row.id, input.collection_id)
                .await;
        }

        let transaction = input
            .transaction
            .clone()
            .or_else(|| row.transaction.clone());
        let peers = ConnectionPeers {
            entity_a: row.entity_a,
            connection_type_id: row.connection_type_id,
            entity_b: row.entity_b,
        };
        let colliding = self
            .find_exact_connections(
                conn,
                &peers,
                input.valid_from,
                input.valid_to,
                transaction.as_ref(),
                Some(row.id),
            )
            .await?;

        match colliding.into_iter().next() {
            None => {
                let old_state = connection_state_of(&row);
                self.update_connection_window(
                    conn,
                    row.id,
                    input.valid_from,
                    input.valid_to,
                    transaction.as_ref(),
                )
                .await?;
                let new_row = self
                    .fetch_connection_row(conn, row.id)
                    .await?
                    .ok_or_else(|| MocError::integrity("connection vanished mid-update"))?;
                let link = self
                    .ensure_connection_link(conn, row.id, input.collection_id)
                    .await?;
                let (changeset_id, _) = self.create_changeset(conn, input.collection_id).await?;
                self.record_connection_change(
                    conn,
                    changeset_id,
                    row.id,
                    ChangeType::Update,
                    Some(&old_state),
                    Some(&connection_state_of(&new_row)),
                )
                .await?;
                Ok(link)
            }
            Some(mut survivor) => {
                if survivor.deleted || !survivor.published {
                    self.set_connection_flags(conn, survivor.id, false, true)
                        .await?;
                    survivor.deleted = false;
                    survivor.published = true;
                }
                self.migrate_connection_dependents(conn, &row, &survivor)
                    .await?;
                let link = self
                    .ensure_connection_link(conn, survivor.id, input.collection_id)
                    .await?;
                let (changeset_id, _) = self.create_changeset(conn, input.collection_id).await?;
                self.record_connection_change(
                    conn,
                    changeset_id,
                    survivor.id,
                    ChangeType::Update,
                    Some(&connection_state_of(&row)),
                    Some(&connection_state_of(&survivor)),
                )
                .await?;
                Ok(link)
            }
        }
    }
}

#[async_trait]
impl ReadApi for MocStore {
    async fn get_canonical_values(
        &self,
        subject: SubjectRef,
        attribute_id: Id,
    ) -> MocResult<Vec<CanonicalValue>> {
        let graph = self.load_schema_graph(&self.conn).await?;
        let rows = self
            .fetch_value_rows(&self.conn, subject, Some(attribute_id))
            .await?;
        let links = self
            .fetch_value_links(&self.conn, &rows.iter().map(|r| r.id).collect::<Vec<_>>())
            .await?;
        self.assemble_canonical(&graph, rows, links)
    }

    async fn get_change_history(
        &self,
        subject: SubjectRef,
        attribute_id: Option<Id>,
        offset: u64,
        limit: u64,
    ) -> MocResult<Vec<ChangeEntry>> {
        let graph = self.load_schema_graph(&self.conn).await?;
        let mut select = Query::select()
            .from(MocLogAttributeValueChanges::Table)
            .columns([
                MocLogAttributeValueChanges::ChangesetId,
                MocLogAttributeValueChanges::EntityId,
                MocLogAttributeValueChanges::ConnectionId,
                MocLogAttributeValueChanges::AttributeId,
                MocLogAttributeValueChanges::ChangeType,
                MocLogAttributeValueChanges::OldValue,
                MocLogAttributeValueChanges::NewValue,
                MocLogAttributeValueChanges::OldCurrency,
                MocLogAttributeValueChanges::NewCurrency,
                MocLogAttributeValueChanges::OldValidFrom,
                MocLogAttributeValueChanges::OldValidTo,
                MocLogAttributeValueChanges::NewValidFrom,
                MocLogAttributeValueChanges::NewValidTo,
                MocLogAttributeValueChanges::RecordedAtHlc,
            ])
            .order_by(MocLogAttributeValueChanges::RecordedAtHlc, Order::Desc)
            .offset(offset)
            .limit(limit)
            .to_owned();
        match subject {
            SubjectRef::Entity(id) => {
                select.and_where(
                    Expr::col(MocLogAttributeValueChanges::EntityId)
                        .eq(id_value(self.backend, id)),
                );
            }
            SubjectRef::Connection(id) => {
                select.and_where(
                    Expr::col(MocLogAttributeValueChanges::ConnectionId)
                        .eq(id_value(self.backend, id)),
                );
            }
        }
        if let Some(attribute_id) = attribute_id {
            select.and_where(
                Expr::col(MocLogAttributeValueChanges::AttributeId)
                    .eq(id_value(self.backend, attribute_id)),
            );
        }

        let rows = query_all(&self.conn, &select).await?;
        let mut changeset_ids = Vec::new();
        for row in &rows {
            changeset_ids.push(read_id(row, MocLogAttributeValueChanges::ChangesetId)?);
        }
        let collections = self.fetch_changeset_collections(&changeset_ids).await?;

        let mut entries = Vec::new();
        for row in rows {
            let changeset_id =
                ChangesetId(read_id(&row, MocLogAttributeValueChanges::ChangesetId)?);
            let attribute = read_id(&row, MocLogAttributeValueChanges::AttributeId)?;
            let change_raw: i16 = get(&row, MocLogAttributeValueChanges::ChangeType)?;
            let change_type = ChangeType::from_i16(change_raw)
                .ok_or_else(|| MocError::storage(format!("unknown change type {change_raw}")))?;
            let old_value = read_value_json(&row, MocLogAttributeValueChanges::OldValue)?;
            let new_value = read_value_json(&row, MocLogAttributeValueChanges::NewValue)?;
            let spec = graph.type_of(attribute).ok();
            let display = |value: &Option<Value>| {
                value.as_ref().and_then(|value| {
                    spec.map(|spec| codec::encode_log(value, spec, &self.format))
                })
            };
            let subject = match (
                read_opt_id(&row, MocLogAttributeValueChanges::EntityId)?,
                read_opt_id(&row, MocLogAttributeValueChanges::ConnectionId)?,
            ) {
                (Some(entity), None) => SubjectRef::Entity(entity),
                (None, Some(connection)) => SubjectRef::Connection(connection),
                _ => return Err(MocError::storage("log row with ambiguous subject")),
            };
            entries.push(ChangeEntry {
                changeset_id,
                collection_id: collections
                    .get(&changeset_id.0)
                    .copied()
                    .ok_or_else(|| MocError::integrity("log row references missing changeset"))?,
                recorded_at: Hlc::from_i64(get(&row, MocLogAttributeValueChanges::RecordedAtHlc)?),
                change_type,
                subject,
                attribute_id: attribute,
                old_display: display(&old_value),
                new_display: display(&new_value),
                old_value,
                new_value,
                old_currency: read_currency(&row, MocLogAttributeValueChanges::OldCurrency)?,
                new_currency: read_currency(&row, MocLogAttributeValueChanges::NewCurrency)?,
                old_valid_from: read_date(&row, MocLogAttributeValueChanges::OldValidFrom)?,
                old_valid_to: read_date(&row, MocLogAttributeValueChanges::OldValidTo)?,
                new_valid_from: read_date(&row, MocLogAttributeValueChanges::NewValidFrom)?,
                new_valid_to: read_date(&row, MocLogAttributeValueChanges::NewValidTo)?,
            });
        }
        Ok(entries)
    }

    async fn get_connection_history(
        &self,
        connection_id: Id,
        offset: u64,
        limit: u64,
    ) -> MocResult<Vec<ConnectionChangeEntry>> {
        let select = Query::select()
            .from(MocLogConnectionChanges::Table)
            .columns([
                MocLogConnectionChanges::ChangesetId,
                MocLogConnectionChanges::ConnectionId,
                MocLogConnectionChanges::ChangeType,
                MocLogConnectionChanges::OldState,
                MocLogConnectionChanges::NewState,
                MocLogConnectionChanges::RecordedAtHlc,
            ])
            .and_where(
                Expr::col(MocLogConnectionChanges::ConnectionId)
                    .eq(id_value(self.backend, connection_id)),
            )
            .order_by(MocLogConnectionChanges::RecordedAtHlc, Order::Desc)
            .offset(offset)
            .limit(limit)
            .to_owned();
        let rows = query_all(&self.conn, &select).await?;
        let mut changeset_ids = Vec::new();
        for row in &rows {
            changeset_ids.push(read_id(row, MocLogConnectionChanges::ChangesetId)?);
        }
        let collections = self.fetch_changeset_collections(&changeset_ids).await?;

        let mut entries = Vec::new();
        for row in rows {
            let changeset_id = ChangesetId(read_id(&row, MocLogConnectionChanges::ChangesetId)?);
            let change_raw: i16 = get(&row, MocLogConnectionChanges::ChangeType)?;
            entries.push(ConnectionChangeEntry {
                changeset_id,
                collection_id: collections
                    .get(&changeset_id.0)
                    .copied()
                    .ok_or_else(|| MocError::integrity("log row references missing changeset"))?,
                recorded_at: Hlc::from_i64(get(&row, MocLogConnectionChanges::RecordedAtHlc)?),
                change_type: ChangeType::from_i16(change_raw).ok_or_else(|| {
                    MocError::storage(format!("unknown change type {change_raw}"))
                })?,
                connection_id: read_id(&row, MocLogConnectionChanges::ConnectionId)?,
                old_state: read_state_json(&row, MocLogConnectionChanges::OldState)?,
                new_state: read_state_json(&row, MocLogConnectionChanges::NewState)?,
            });
        }
        Ok(entries)
    }

    async fn materialize(
        &self,
        subject: SubjectRef,
        attribute_ids: Option<Vec<Id>>,
    ) -> MocResult<Materialized> {
        let graph = self.load_schema_graph(&self.conn).await?;
        let mut rows = self.fetch_value_rows(&self.conn, subject, None).await?;
        if let Some(filter) = &attribute_ids {
            let keep: HashSet<Id> = filter.iter().copied().collect();
            rows.retain(|row| keep.contains(&row.attribute_id));
        }
        let links = self
            .fetch_value_links(&self.conn, &rows.iter().map(|r| r.id).collect::<Vec<_>>())
            .await?;
        let values = self.assemble_canonical(&graph, rows, links)?;
        Ok(Materialized { subject, values })
    }

    async fn get_connection(&self, connection_id: Id) -> MocResult<ConnectionRecord> {
        self.fetch_connection_row(&self.conn, connection_id)
            .await?
            .ok_or_else(|| MocError::not_found(format!("connection {connection_id}")))
    }
}

impl MocStore {
    fn assemble_canonical(
        &self,
        graph: &SchemaGraph,
        rows: Vec<AttributeValueRow>,
        links: Vec<ValueLinkRow>,
    ) -> MocResult<Vec<CanonicalValue>> {
        let mut values = Vec::new();
        for row in rows {
            let spec = graph.type_of(row.attribute_id)?;
            let value = Value::from_slots(spec.data_type, &row.slots)?;
            let encoded = codec::encode(&value, spec, &self.format);
            let mut provenance: Vec<Provenance> = links
                .iter()
                .filter(|link| link.attribute_value_id == row.id)
                .map(|link| Provenance {
                    collection_id: link.collection_id,
                    valid_from: link.valid_from,
                    valid_to: link.valid_to,
                    created_at: link.created_at,
                    updated_at: link.updated_at,
                })
                .collect();
            provenance.sort_by_key(|p| p.created_at);
            values.push(CanonicalValue {
                attribute_value_id: row.id,
                attribute_id: row.attribute_id,
                value,
                encoded,
                currency: row.currency,
                provenance,
            });
        }
        Ok(values)
    }

    async fn fetch_changeset_collections(
        &self,
        changeset_ids: &[Id],
    ) -> MocResult<HashMap<Id, CollectionId>> {
        if changeset_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let select = Query::select()
            .from(MocChangesets::Table)
            .columns([MocChangesets::ChangesetId, MocChangesets::CollectionId])
            .and_where(
                Expr::col(MocChangesets::ChangesetId)
                    .is_in(changeset_ids.iter().map(|id| id_value(self.backend, *id))),
            )
            .to_owned();
        let mut map = HashMap::new();
        for row in query_all(&self.conn, &select).await? {
            map.insert(
                read_id(&row, MocChangesets::ChangesetId)?,
                CollectionId(read_id(&row, MocChangesets::CollectionId)?),
            );
        }
        Ok(map)
    }
}

#[derive(Clone, Debug)]
struct AttributeValueRow {
    id: Id,
    entity_id: Option<Id>,
    connection_id: Option<Id>,
    attribute_id: Id,
    slots: ValueSlots,
    currency: Option<Currency>,
    content_key: String,
}

#[derive(Clone, Debug)]
struct ValueLinkRow {
    id: Id,
    attribute_value_id: Id,
    collection_id: CollectionId,
    valid_from: Option<NaiveDate>,
    valid_to: Option<NaiveDate>,
    created_at: Stamp,
    updated_at: Stamp,
}

#[derive(Clone, Debug)]
struct ConnectionLinkRow {
    id: Id,
    connection_id: Id,
    collection_id: CollectionId,
    deleted: bool,
    created_at: Stamp,
    updated_at: Stamp,
}

/// One side of a value transition as it goes into the log.
struct ValueChangeSide {
    value: Value,
    currency: Option<Currency>,
    valid_from: Option<NaiveDate>,
    valid_to: Option<NaiveDate>,
}

fn connection_select() -> SelectStatement {
    Query::select()
        .from(MocEntityConnections::Table)
        .columns([
            MocEntityConnections::ConnectionId,
            MocEntityConnections::EntityAId,
            MocEntityConnections::EntityBId,
            MocEntityConnections::ConnectionTypeId,
            MocEntityConnections::ValidFrom,
            MocEntityConnections::ValidTo,
            MocEntityConnections::TxAmount,
            MocEntityConnections::TxCurrency,
            MocEntityConnections::TxDate,
            MocEntityConnections::Deleted,
            MocEntityConnections::Published,
        ])
        .to_owned()
}

fn read_connection_record(row: &QueryResult) -> MocResult<ConnectionRecord> {
    let amount: Option<i64> = get(row, MocEntityConnections::TxAmount)?;
    let currency = read_currency(row, MocEntityConnections::TxCurrency)?;
    let date = read_date(row, MocEntityConnections::TxDate)?;
    let transaction = match (amount, currency, date) {
        (Some(amount), Some(currency), Some(date)) => Some(TransactionInfo {
            amount,
            currency,
            date,
        }),
        (None, None, None) => None,
        _ => {
            return Err(MocError::integrity(
                "connection row with a partial transaction triple",
            ))
        }
    };
    Ok(ConnectionRecord {
        id: read_id(row, MocEntityConnections::ConnectionId)?,
        entity_a: read_id(row, MocEntityConnections::EntityAId)?,
        entity_b: read_id(row, MocEntityConnections::EntityBId)?,
        connection_type_id: read_id(row, MocEntityConnections::ConnectionTypeId)?,
        valid_from: read_date(row, MocEntityConnections::ValidFrom)?,
        valid_to: read_date(row, MocEntityConnections::ValidTo)?,
        transaction,
        deleted: get(row, MocEntityConnections::Deleted)?,
        published: get(row, MocEntityConnections::Published)?,
    })
}

fn connection_state_of(record: &ConnectionRecord) -> ConnectionState {
    ConnectionState {
        entity_a: record.entity_a,
        entity_b: record.entity_b,
        connection_type_id: record.connection_type_id,
        valid_from: record.valid_from,
        valid_to: record.valid_to,
        transaction: record.transaction.clone(),
        deleted: record.deleted,
        published: record.published,
    }
}

fn read_value_row(row: &QueryResult) -> MocResult<AttributeValueRow> {
    let slots = ValueSlots {
        value_boolean: get(row, MocAttributeValues::ValueBoolean)?,
        value_int: get(row, MocAttributeValues::ValueInt)?,
        value_int_to: get(row, MocAttributeValues::ValueIntTo)?,
        value_float: get(row, MocAttributeValues::ValueFloat)?,
        value_float_to: get(row, MocAttributeValues::ValueFloatTo)?,
        value_string: get(row, MocAttributeValues::ValueString)?,
        value_text: get(row, MocAttributeValues::ValueText)?,
        value_datetime: get(row, MocAttributeValues::ValueDatetime)?,
        value_datetime_to: get(row, MocAttributeValues::ValueDatetimeTo)?,
        value_date: read_date(row, MocAttributeValues::ValueDate)?,
        value_date_to: read_date(row, MocAttributeValues::ValueDateTo)?,
        codebook_value_id: read_opt_id(row, MocAttributeValues::CodebookValueId)?,
    };
    Ok(AttributeValueRow {
        id: read_id(row, MocAttributeValues::AttributeValueId)?,
        entity_id: read_opt_id(row, MocAttributeValues::EntityId)?,
        connection_id: read_opt_id(row, MocAttributeValues::ConnectionId)?,
        attribute_id: read_id(row, MocAttributeValues::AttributeId)?,
        slots,
        currency: read_currency(row, MocAttributeValues::Currency)?,
        content_key: get(row, MocAttributeValues::ContentKey)?,
    })
}

fn read_value_json(row: &QueryResult, column: impl sea_query::Iden) -> MocResult<Option<Value>> {
    let raw: Option<String> = get(row, column)?;
    raw.map(|raw| {
        serde_json::from_str(&raw)
            .map_err(|err| MocError::integrity(format!("corrupt log value: {err}")))
    })
    .transpose()
}

fn read_state_json(
    row: &QueryResult,
    column: impl sea_query::Iden,
) -> MocResult<Option<ConnectionState>> {
    let raw: Option<String> = get(row, column)?;
    raw.map(|raw| {
        serde_json::from_str(&raw)
            .map_err(|err| MocError::integrity(format!("corrupt log state: {err}")))
    })
    .transpose()
}

fn read_currency(row: &QueryResult, column: impl sea_query::Iden) -> MocResult<Option<Currency>> {
    let raw: Option<String> = get(row, column)?;
    raw.map(|raw| Currency::parse(&raw)).transpose()
}

fn read_date(row: &QueryResult, column: impl sea_query::Iden) -> MocResult<Option<NaiveDate>> {
    let raw: Option<String> = get(row, column)?;
    raw.map(|raw| {
        NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
            .map_err(|err| MocError::integrity(format!("corrupt stored date '{raw}': {err}")))
    })
    .transpose()
}

fn date_text(date: Option<NaiveDate>) -> Option<String> {
    date.map(|date| date.format("%Y-%m-%d").to_string())
}

async fn upsert_named<C, T, Col>(
    conn: &C,
    backend: DatabaseBackend,
    table: T,
    id_col: Col,
    name_col: Col,
    id: Id,
    name: &str,
) -> MocResult<()>
where
    C: ConnectionTrait,
    T: sea_query::IntoTableRef,
    Col: sea_query::IntoIden + Copy,
{
    let insert = Query::insert()
        .into_table(table)
        .columns([id_col, name_col])
        .values_panic([id_value(backend, id).into(), name.to_string().into()])
        .on_conflict(
            OnConflict::column(id_col)
                .update_column(name_col)
                .to_owned(),
        )
        .to_owned();
    exec(conn, &insert).await
}

fn id_value(backend: DatabaseBackend, id: Id) -> SeaValue {
    match backend {
        DatabaseBackend::Postgres => SeaValue::Uuid(Some(id.as_uuid())),
        DatabaseBackend::MySql => SeaValue::Bytes(Some(id.as_vec())),
        _ => SeaValue::String(Some(id.to_string())),
    }
}

fn none_id_value(backend: DatabaseBackend) -> SeaValue {
    match backend {
        DatabaseBackend::Postgres => SeaValue::Uuid(None),
        DatabaseBackend::MySql => SeaValue::Bytes(None),
        _ => SeaValue::String(None),
    }
}

fn opt_id_value(backend: DatabaseBackend, id: Option<Id>) -> SeaValue {
    match id {
        Some(id) => id_value(backend, id),
        None => none_id_value(backend),
    }
}

fn get<T: TryGetable>(row: &QueryResult, column: impl sea_query::Iden) -> MocResult<T> {
    row.try_get("", &col_name(column)).map_err(db_err)
}

fn read_id(row: &QueryResult, column: impl sea_query::Iden) -> MocResult<Id> {
    read_opt_id(row, column)?.ok_or_else(|| MocError::storage("unexpected null id"))
}

fn read_opt_id(row: &QueryResult, column: impl sea_query::Iden) -> MocResult<Option<Id>> {
    let name = col_name(column);
    if let Ok(value) = row.try_get::<Option<String>>("", &name) {
        return value.map(|value| Id::parse(&value)).transpose();
    }
    if let Ok(value) = row.try_get::<Option<Uuid>>("", &name) {
        return Ok(value.map(|value| Id::from_bytes(*value.as_bytes())));
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>>("", &name) {
        return value
            .map(|bytes| {
                let buf: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| MocError::storage("invalid id length"))?;
                Ok(Id::from_bytes(buf))
            })
            .transpose();
    }
    Ok(None)
}

fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

fn db_err(err: sea_orm::DbErr) -> MocError {
    MocError::storage(err.to_string())
}

fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        _ => stmt.build(SqliteQueryBuilder),
    }
}

async fn exec<C, S>(conn: &C, stmt: &S) -> MocResult<()>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    conn.execute_raw(Statement::from_sql_and_values(backend, sql, values))
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn query_all<C, S>(conn: &C, stmt: &S) -> MocResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    conn.query_all_raw(Statement::from_sql_and_values(backend, sql, values))
        .await
        .map_err(db_err)
}

async fn query_one<C, S>(conn: &C, stmt: &S) -> MocResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    conn.query_one_raw(Statement::from_sql_and_values(backend, sql, values))
        .await
        .map_err(db_err)
}

fn build_connection_url(config: &MocConfig, base_dir: &Path) -> MocResult<String> {
    match &config.database {
        crate::DatabaseConfig::Sqlite { .. } => {
            let path = config.sqlite_path(base_dir)?;
            Ok(format!("sqlite://{}?mode=rwc", path.display()))
        }
        crate::DatabaseConfig::Postgres { url } | crate::DatabaseConfig::Mysql { url } => {
            Ok(url.clone())
        }
    }
}

/// Human-stable public identifier: NFKD fold, ascii alphanumerics kept,
/// everything else collapsed into single dashes.
fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for c in name.nfkd() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if (c.is_whitespace() || c.is_ascii_punctuation()) && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "entity".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::slugify;

    #[test]
    fn slugify_folds_diacritics_and_punctuation() {
        assert_eq!(slugify("Žlutý kůň, a.s."), "zluty-kun-a-s");
        assert_eq!(slugify("  ACME  Holdings  "), "acme-holdings");
        assert_eq!(slugify("***"), "entity");
    }
}
