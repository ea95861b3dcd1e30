use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::{
    AttributeTypeSpec, ChangesetId, CollectionId, Currency, Hlc, Id, MocError, MocResult, Stamp,
    Value,
};

/// The thing an attribute value describes: exactly one of an entity or a
/// connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectRef {
    Entity(Id),
    Connection(Id),
}

impl SubjectRef {
    pub fn entity_id(self) -> Option<Id> {
        match self {
            SubjectRef::Entity(id) => Some(id),
            SubjectRef::Connection(_) => None,
        }
    }

    pub fn connection_id(self) -> Option<Id> {
        match self {
            SubjectRef::Connection(id) => Some(id),
            SubjectRef::Entity(_) => None,
        }
    }
}

/// One ingestion claim: a collection asserting a value for a
/// subject+attribute over an optional validity window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpsertAttributeValueInput {
    pub subject: SubjectRef,
    pub attribute_id: Id,
    pub raw_value: String,
    pub currency: Option<Currency>,
    pub collection_id: CollectionId,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
}

/// Endpoints of a new connection. `entity_a`/`entity_b` are unordered for
/// dedup purposes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConnectionPeers {
    pub entity_a: Id,
    pub connection_type_id: Id,
    pub entity_b: Id,
}

/// All-or-none transaction triple attached to a connection. Amounts are
/// minor currency units.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub amount: i64,
    pub currency: Currency,
    pub date: NaiveDate,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpsertConnectionInput {
    /// New-connection path; mutually exclusive with `update_connection`.
    pub peers: Option<ConnectionPeers>,
    /// Update path: re-validate an existing connection's window under
    /// this collection.
    pub update_connection: Option<Id>,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub transaction: Option<TransactionInfo>,
    pub collection_id: CollectionId,
}

impl UpsertConnectionInput {
    pub fn validate(&self) -> MocResult<()> {
        match (&self.peers, self.update_connection) {
            (Some(_), Some(_)) => Err(MocError::schema(
                "supply either new-connection endpoints or update_connection, not both",
            )),
            (None, None) => Err(MocError::schema(
                "supply new-connection endpoints or update_connection",
            )),
            _ => {
                if let Some(peers) = &self.peers {
                    if peers.entity_a == peers.entity_b {
                        return Err(MocError::schema("a connection needs two distinct entities"));
                    }
                }
                if let (Some(from), Some(to)) = (self.valid_from, self.valid_to) {
                    if from > to {
                        return Err(MocError::schema("valid_from is after valid_to"));
                    }
                }
                Ok(())
            }
        }
    }
}

/// Provenance link returned by `upsert_attribute_value`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueLink {
    pub id: Id,
    pub attribute_value_id: Id,
    pub collection_id: CollectionId,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub created_at: Stamp,
    pub updated_at: Stamp,
}

/// Provenance link returned by `upsert_connection`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionLink {
    pub id: Id,
    pub connection_id: Id,
    pub collection_id: CollectionId,
    pub created_at: Stamp,
    pub updated_at: Stamp,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i16)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create = 1,
    Update = 2,
}

impl ChangeType {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(ChangeType::Create),
            2 => Some(ChangeType::Update),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub collection_id: CollectionId,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub created_at: Stamp,
    pub updated_at: Stamp,
}

/// A canonical (deduplicated) value for a subject+attribute, with every
/// collection that asserts it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalValue {
    pub attribute_value_id: Id,
    pub attribute_id: Id,
    pub value: Value,
    pub encoded: String,
    pub currency: Option<Currency>,
    pub provenance: Vec<Provenance>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Materialized {
    pub subject: SubjectRef,
    pub values: Vec<CanonicalValue>,
}

/// One attribute-value transition from the immutable log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub changeset_id: ChangesetId,
    pub collection_id: CollectionId,
    pub recorded_at: Hlc,
    pub change_type: ChangeType,
    pub subject: SubjectRef,
    pub attribute_id: Id,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    /// Display rendition of the values, unset bounds spelled as `null`.
    pub old_display: Option<String>,
    pub new_display: Option<String>,
    pub old_currency: Option<Currency>,
    pub new_currency: Option<Currency>,
    pub old_valid_from: Option<NaiveDate>,
    pub old_valid_to: Option<NaiveDate>,
    pub new_valid_from: Option<NaiveDate>,
    pub new_valid_to: Option<NaiveDate>,
}

/// One connection transition from the immutable log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionChangeEntry {
    pub changeset_id: ChangesetId,
    pub collection_id: CollectionId,
    pub recorded_at: Hlc,
    pub change_type: ChangeType,
    pub connection_id: Id,
    pub old_state: Option<ConnectionState>,
    pub new_state: Option<ConnectionState>,
}

/// Full connection image captured on either side of a transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub entity_a: Id,
    pub entity_b: Id,
    pub connection_type_id: Id,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub transaction: Option<TransactionInfo>,
    pub deleted: bool,
    pub published: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: Id,
    pub public_id: String,
    pub entity_type_id: Id,
    pub deleted: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: Id,
    pub entity_a: Id,
    pub entity_b: Id,
    pub connection_type_id: Id,
    pub valid_from: Option<NaiveDate>,
    pub valid_to: Option<NaiveDate>,
    pub transaction: Option<TransactionInfo>,
    pub deleted: bool,
    pub published: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodebookValueRecord {
    pub id: Id,
    pub codebook_id: Id,
    pub label: String,
}

/// Schema objects upserted in one administrative batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchemaBatch {
    pub entity_types: Vec<NamedDef>,
    pub connection_types: Vec<NamedDef>,
    pub sources: Vec<SourceDef>,
    pub collections: Vec<CollectionDef>,
    pub codebooks: Vec<NamedDef>,
    pub codebook_values: Vec<CodebookValueRecord>,
    pub attribute_types: Vec<AttributeTypeSpec>,
    pub attributes: Vec<AttributeInput>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedDef {
    pub id: Id,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceDef {
    pub id: Id,
    pub name: String,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionDef {
    pub id: CollectionId,
    pub source_id: Id,
    pub name: String,
    pub published: bool,
    pub deleted: bool,
}

/// Unvalidated attribute row; exactly one owner field must be set. The
/// store validates and converts into an `AttributeDef`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeInput {
    pub id: Id,
    pub name: String,
    pub attribute_type_id: Id,
    pub entity_type_id: Option<Id>,
    pub collection_id: Option<CollectionId>,
    pub parent_id: Option<Id>,
}

impl AttributeInput {
    pub fn owner(&self) -> MocResult<crate::AttributeOwner> {
        match (self.entity_type_id, self.collection_id, self.parent_id) {
            (Some(entity_type), None, None) => Ok(crate::AttributeOwner::EntityType(entity_type)),
            (None, Some(collection), None) => Ok(crate::AttributeOwner::Collection(collection)),
            (None, None, Some(parent)) => Ok(crate::AttributeOwner::Parent(parent)),
            _ => Err(MocError::schema(format!(
                "attribute '{}' must have exactly one of entity type, collection, or parent",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AttributeInput, ConnectionPeers, UpsertConnectionInput};
    use crate::{CollectionId, Id};

    fn connection_input() -> UpsertConnectionInput {
        UpsertConnectionInput {
            peers: Some(ConnectionPeers {
                entity_a: Id::new(),
                connection_type_id: Id::new(),
                entity_b: Id::new(),
            }),
            update_connection: None,
            valid_from: None,
            valid_to: None,
            transaction: None,
            collection_id: CollectionId(Id::new()),
        }
    }

    #[test]
    fn connection_input_paths_are_mutually_exclusive() {
        let mut input = connection_input();
        assert!(input.validate().is_ok());

        input.update_connection = Some(Id::new());
        assert!(input.validate().is_err());

        input.peers = None;
        assert!(input.validate().is_ok());

        input.update_connection = None;
        assert!(input.validate().is_err());
    }

    #[test]
    fn connection_endpoints_must_differ() {
        let mut input = connection_input();
        let same = Id::new();
        input.peers = Some(ConnectionPeers {
            entity_a: same,
            connection_type_id: Id::new(),
            entity_b: same,
        });
        assert!(input.validate().is_err());
    }

    #[test]
    fn attribute_owner_is_exactly_one_of_three() {
        let mut input = AttributeInput {
            id: Id::new(),
            name: "seat".to_string(),
            attribute_type_id: Id::new(),
            entity_type_id: Some(Id::new()),
            collection_id: None,
            parent_id: None,
        };
        assert!(input.owner().is_ok());

        input.collection_id = Some(CollectionId(Id::new()));
        assert!(input.owner().is_err());

        input.entity_type_id = None;
        input.collection_id = None;
        assert!(input.owner().is_err());
    }
}
