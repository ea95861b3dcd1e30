use sea_orm::sea_query;
use sea_orm_migration::prelude::Iden;

#[derive(Iden, Clone, Copy)]
pub enum MocEntityTypes {
    Table,
    EntityTypeId,
    Name,
}

#[derive(Iden, Clone, Copy)]
pub enum MocConnectionTypes {
    Table,
    ConnectionTypeId,
    Name,
}

#[derive(Iden, Clone, Copy)]
pub enum MocSources {
    Table,
    SourceId,
    Name,
    Active,
}

#[derive(Iden, Clone, Copy)]
pub enum MocCollections {
    Table,
    CollectionId,
    SourceId,
    Name,
    Published,
    Deleted,
}

#[derive(Iden, Clone, Copy)]
pub enum MocEntities {
    Table,
    EntityId,
    PublicId,
    EntityTypeId,
    Deleted,
}

#[derive(Iden, Clone, Copy)]
pub enum MocCodebooks {
    Table,
    CodebookId,
    Name,
}

#[derive(Iden, Clone, Copy)]
pub enum MocCodebookValues {
    Table,
    CodebookValueId,
    CodebookId,
    Label,
}

#[derive(Iden, Clone, Copy)]
pub enum MocAttributeTypes {
    Table,
    AttributeTypeId,
    Name,
    DataType,
    DecimalPlaces,
    CodebookId,
    FromInclusive,
    ToInclusive,
}

#[derive(Iden, Clone, Copy)]
pub enum MocAttributes {
    Table,
    AttributeId,
    Name,
    AttributeTypeId,
    EntityTypeId,
    CollectionId,
    ParentAttributeId,
}

#[derive(Iden, Clone, Copy)]
pub enum MocEntityConnections {
    Table,
    ConnectionId,
    EntityAId,
    EntityBId,
    ConnectionTypeId,
    ValidFrom,
    ValidTo,
    TxAmount,
    TxCurrency,
    TxDate,
    Deleted,
    Published,
}

#[derive(Iden, Clone, Copy)]
pub enum MocEntityConnectionCollections {
    Table,
    LinkId,
    ConnectionId,
    CollectionId,
    Deleted,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum MocAttributeValues {
    Table,
    AttributeValueId,
    EntityId,
    ConnectionId,
    AttributeId,
    ValueBoolean,
    ValueInt,
    ValueIntTo,
    ValueFloat,
    ValueFloatTo,
    ValueString,
    ValueText,
    ValueDatetime,
    ValueDatetimeTo,
    ValueDate,
    ValueDateTo,
    CodebookValueId,
    Currency,
    ContentKey,
}

#[derive(Iden, Clone, Copy)]
pub enum MocAttributeValueCollections {
    Table,
    LinkId,
    AttributeValueId,
    CollectionId,
    ValidFrom,
    ValidTo,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum MocChangesets {
    Table,
    ChangesetId,
    CollectionId,
    CreatedAtHlc,
}

#[derive(Iden, Clone, Copy)]
pub enum MocLogAttributeValueChanges {
    Table,
    LogId,
    ChangesetId,
    EntityId,
    ConnectionId,
    AttributeId,
    ChangeType,
    OldValue,
    NewValue,
    OldCurrency,
    NewCurrency,
    OldValidFrom,
    OldValidTo,
    NewValidFrom,
    NewValidTo,
    RecordedAtHlc,
}

#[derive(Iden, Clone, Copy)]
pub enum MocLogConnectionChanges {
    Table,
    LogId,
    ChangesetId,
    ConnectionId,
    ChangeType,
    OldState,
    NewState,
    RecordedAtHlc,
}
