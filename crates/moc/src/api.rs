use async_trait::async_trait;

use moc_core::{
    CanonicalValue, ChangeEntry, CodebookValueRecord, CollectionId, ConnectionChangeEntry,
    ConnectionLink, ConnectionRecord, EntityRecord, Id, Materialized, MocResult, SchemaBatch,
    SubjectRef, UpsertAttributeValueInput, UpsertConnectionInput, ValueLink,
};

/// Administrative surface: schema objects and entity registration.
#[async_trait]
pub trait SchemaAdminApi {
    /// Validate and upsert a batch of schema objects in one transaction.
    async fn upsert_schema_batch(&self, batch: SchemaBatch) -> MocResult<()>;

    /// Register an entity under a slugified, human-stable public id. A
    /// taken slug gets a disambiguation counter suffix.
    async fn register_entity(&self, name: &str, entity_type_id: Id) -> MocResult<EntityRecord>;

    /// Codebook lookup collaborator: resolve a value inside one codebook.
    async fn resolve_codebook_value(
        &self,
        codebook_id: Id,
        value_id: Id,
    ) -> MocResult<CodebookValueRecord>;
}

/// Ingestion entry points. Each call runs as a single atomic transaction
/// and emits change-log rows under a fresh changeset.
#[async_trait]
pub trait IngestApi {
    async fn upsert_attribute_value(
        &self,
        input: UpsertAttributeValueInput,
    ) -> MocResult<ValueLink>;

    async fn upsert_connection(&self, input: UpsertConnectionInput) -> MocResult<ConnectionLink>;

    /// Take a connection out of circulation without losing its history.
    /// A later exact re-assertion reactivates it.
    async fn soft_delete_connection(
        &self,
        connection_id: Id,
        collection_id: CollectionId,
    ) -> MocResult<()>;
}

/// Read accessors. These bypass merge logic and format canonical values
/// back through the codec.
#[async_trait]
pub trait ReadApi {
    async fn get_canonical_values(
        &self,
        subject: SubjectRef,
        attribute_id: Id,
    ) -> MocResult<Vec<CanonicalValue>>;

    /// Attribute-value history for a subject, newest first.
    async fn get_change_history(
        &self,
        subject: SubjectRef,
        attribute_id: Option<Id>,
        offset: u64,
        limit: u64,
    ) -> MocResult<Vec<ChangeEntry>>;

    /// Connection transition history, newest first.
    async fn get_connection_history(
        &self,
        connection_id: Id,
        offset: u64,
        limit: u64,
    ) -> MocResult<Vec<ConnectionChangeEntry>>;

    /// Every canonical value of a subject, optionally filtered; the
    /// presentation layer decides projection shape.
    async fn materialize(
        &self,
        subject: SubjectRef,
        attribute_ids: Option<Vec<Id>>,
    ) -> MocResult<Materialized>;

    async fn get_connection(&self, connection_id: Id) -> MocResult<ConnectionRecord>;
}
