use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{CollectionId, DataType, Id, MocError, MocResult};

/// Attribute type: a data kind plus the configuration that kind needs.
/// Fields irrelevant to the chosen kind must stay unset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeTypeSpec {
    pub id: Id,
    pub name: String,
    pub data_type: DataType,
    /// Fixed-point kinds only; falls back to the format config when unset.
    pub decimal_places: Option<u32>,
    /// Codebook kind only, and required there.
    pub codebook_id: Option<Id>,
    /// RangeFloatingPoint only.
    pub from_inclusive: Option<bool>,
    /// RangeFloatingPoint only.
    pub to_inclusive: Option<bool>,
}

impl AttributeTypeSpec {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: Id::new(),
            name: name.into(),
            data_type,
            decimal_places: None,
            codebook_id: None,
            from_inclusive: None,
            to_inclusive: None,
        }
    }

    pub fn validate(&self) -> MocResult<()> {
        let kind = self.data_type;
        if let Some(places) = self.decimal_places {
            if !kind.is_fixed_point() {
                return Err(MocError::schema(format!(
                    "attribute type '{}': decimal_places is only valid for fixed-point kinds",
                    self.name
                )));
            }
            // The scaled integer must stay inside i64.
            if places > 12 {
                return Err(MocError::schema(format!(
                    "attribute type '{}': decimal_places above 12 is not supported",
                    self.name
                )));
            }
        }
        match (kind, self.codebook_id) {
            (DataType::Codebook, None) => {
                return Err(MocError::schema(format!(
                    "attribute type '{}': codebook kind requires a codebook",
                    self.name
                )));
            }
            (DataType::Codebook, Some(_)) => {}
            (_, Some(_)) => {
                return Err(MocError::schema(format!(
                    "attribute type '{}': codebook is only valid for the codebook kind",
                    self.name
                )));
            }
            (_, None) => {}
        }
        if (self.from_inclusive.is_some() || self.to_inclusive.is_some())
            && kind != DataType::RangeFloatingPoint
        {
            return Err(MocError::schema(format!(
                "attribute type '{}': inclusivity flags are only valid for range_floating_point",
                self.name
            )));
        }
        Ok(())
    }
}

/// The one place an attribute hangs off: an entity type, a collection, or
/// a parent attribute (sub-attribute of a complex type).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeOwner {
    EntityType(Id),
    Collection(CollectionId),
    Parent(Id),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub id: Id,
    pub name: String,
    pub attribute_type_id: Id,
    pub owner: AttributeOwner,
}

/// In-memory arena of the attribute forest plus its types. All traversals
/// are iterative with a visited-set guard; a parent cycle is a
/// configuration error surfaced as a schema violation.
#[derive(Clone, Debug, Default)]
pub struct SchemaGraph {
    attributes: HashMap<Id, AttributeDef>,
    attribute_types: HashMap<Id, AttributeTypeSpec>,
}

impl SchemaGraph {
    pub fn new(
        attributes: impl IntoIterator<Item = AttributeDef>,
        attribute_types: impl IntoIterator<Item = AttributeTypeSpec>,
    ) -> Self {
        Self {
            attributes: attributes.into_iter().map(|a| (a.id, a)).collect(),
            attribute_types: attribute_types.into_iter().map(|t| (t.id, t)).collect(),
        }
    }

    pub fn attribute(&self, id: Id) -> MocResult<&AttributeDef> {
        self.attributes
            .get(&id)
            .ok_or_else(|| MocError::not_found(format!("attribute {id}")))
    }

    pub fn type_of(&self, attribute_id: Id) -> MocResult<&AttributeTypeSpec> {
        let attribute = self.attribute(attribute_id)?;
        self.attribute_types
            .get(&attribute.attribute_type_id)
            .ok_or_else(|| {
                MocError::integrity(format!(
                    "attribute '{}' references a missing attribute type",
                    attribute.name
                ))
            })
    }

    /// Follow the parent chain to its fixed point.
    pub fn root_of(&self, attribute_id: Id) -> MocResult<&AttributeDef> {
        let mut current = self.attribute(attribute_id)?;
        let mut visited = HashSet::new();
        visited.insert(current.id);
        while let AttributeOwner::Parent(parent_id) = current.owner {
            if !visited.insert(parent_id) {
                return Err(MocError::schema(format!(
                    "attribute '{}' sits on a parent cycle",
                    current.name
                )));
            }
            current = self.attribute(parent_id)?;
        }
        Ok(current)
    }

    pub fn is_entity_attribute(&self, attribute_id: Id) -> MocResult<bool> {
        Ok(matches!(
            self.root_of(attribute_id)?.owner,
            AttributeOwner::EntityType(_)
        ))
    }

    pub fn is_connection_attribute(&self, attribute_id: Id) -> MocResult<bool> {
        Ok(matches!(
            self.root_of(attribute_id)?.owner,
            AttributeOwner::Collection(_)
        ))
    }

    pub fn applies_to_entity_type(&self, attribute_id: Id, entity_type_id: Id) -> MocResult<bool> {
        Ok(match self.root_of(attribute_id)?.owner {
            AttributeOwner::EntityType(owner) => owner == entity_type_id,
            _ => false,
        })
    }

    /// The collection a connection-scoped attribute is declared under,
    /// recursing through parents.
    pub fn declared_collection(&self, attribute_id: Id) -> MocResult<Option<CollectionId>> {
        Ok(match self.root_of(attribute_id)?.owner {
            AttributeOwner::Collection(collection) => Some(collection),
            _ => None,
        })
    }

    /// Whether the attribute's declared collection is among the given set
    /// of active collections (the caller resolves which collections are
    /// active for a particular connection).
    pub fn applies_to_collections(
        &self,
        attribute_id: Id,
        active: &HashSet<CollectionId>,
    ) -> MocResult<bool> {
        Ok(self
            .declared_collection(attribute_id)?
            .is_some_and(|collection| active.contains(&collection)))
    }

    /// Creation-time validation for a batch of attributes about to join the
    /// graph: owner kinds must exist, parents must be complex, and the
    /// resulting forest must stay acyclic.
    pub fn validate_attribute(&self, attribute: &AttributeDef) -> MocResult<()> {
        if let AttributeOwner::Parent(parent_id) = attribute.owner {
            let parent = self.attribute(parent_id).map_err(|_| {
                MocError::schema(format!(
                    "attribute '{}' references a missing parent",
                    attribute.name
                ))
            })?;
            let parent_type = self.type_of(parent.id)?;
            if !parent_type.data_type.is_composite() {
                return Err(MocError::schema(format!(
                    "attribute '{}': parent '{}' is not a complex attribute",
                    attribute.name, parent.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{AttributeDef, AttributeOwner, AttributeTypeSpec, SchemaGraph};
    use crate::{CollectionId, DataType, Id};

    fn graph() -> (SchemaGraph, Id, Id, Id, CollectionId) {
        let entity_type = Id::new();
        let collection = CollectionId(Id::new());
        let complex_type = AttributeTypeSpec::new("composite", DataType::Complex);
        let string_type = AttributeTypeSpec::new("string", DataType::String);
        let parent = AttributeDef {
            id: Id::new(),
            name: "seat".to_string(),
            attribute_type_id: complex_type.id,
            owner: AttributeOwner::Collection(collection),
        };
        let child = AttributeDef {
            id: Id::new(),
            name: "seat_street".to_string(),
            attribute_type_id: string_type.id,
            owner: AttributeOwner::Parent(parent.id),
        };
        let entity_scoped = AttributeDef {
            id: Id::new(),
            name: "vat_number".to_string(),
            attribute_type_id: string_type.id,
            owner: AttributeOwner::EntityType(entity_type),
        };
        let child_id = child.id;
        let entity_attr_id = entity_scoped.id;
        let graph = SchemaGraph::new(
            [parent, child, entity_scoped],
            [complex_type, string_type],
        );
        (graph, child_id, entity_attr_id, entity_type, collection)
    }

    #[test]
    fn root_resolution_walks_parents() {
        let (graph, child_id, entity_attr_id, entity_type, collection) = graph();
        assert_eq!(
            graph.root_of(child_id).expect("root").owner,
            AttributeOwner::Collection(collection)
        );
        assert!(graph.is_connection_attribute(child_id).expect("scoped"));
        assert!(!graph.is_entity_attribute(child_id).expect("scoped"));
        assert!(graph
            .applies_to_entity_type(entity_attr_id, entity_type)
            .expect("applies"));
    }

    #[test]
    fn collection_applicability_recurses_to_root() {
        let (graph, child_id, _, _, collection) = graph();
        let mut active = HashSet::new();
        assert!(!graph
            .applies_to_collections(child_id, &active)
            .expect("inactive"));
        active.insert(collection);
        assert!(graph
            .applies_to_collections(child_id, &active)
            .expect("active"));
    }

    #[test]
    fn parent_cycles_are_schema_errors() {
        let string_type = AttributeTypeSpec::new("string", DataType::String);
        let a = Id::new();
        let b = Id::new();
        let graph = SchemaGraph::new(
            [
                AttributeDef {
                    id: a,
                    name: "a".to_string(),
                    attribute_type_id: string_type.id,
                    owner: AttributeOwner::Parent(b),
                },
                AttributeDef {
                    id: b,
                    name: "b".to_string(),
                    attribute_type_id: string_type.id,
                    owner: AttributeOwner::Parent(a),
                },
            ],
            [string_type],
        );
        assert!(graph.root_of(a).is_err());
    }

    #[test]
    fn type_config_relevance_is_enforced() {
        let mut spec = AttributeTypeSpec::new("amount", DataType::FixedPoint);
        spec.decimal_places = Some(2);
        assert!(spec.validate().is_ok());

        spec.data_type = DataType::String;
        assert!(spec.validate().is_err());

        let mut codebook = AttributeTypeSpec::new("legal_form", DataType::Codebook);
        assert!(codebook.validate().is_err());
        codebook.codebook_id = Some(Id::new());
        assert!(codebook.validate().is_ok());

        let mut range = AttributeTypeSpec::new("share", DataType::RangeFloatingPoint);
        range.from_inclusive = Some(true);
        assert!(range.validate().is_ok());
        range.data_type = DataType::RangeInt;
        assert!(range.validate().is_err());
    }
}
