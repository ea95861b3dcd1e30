use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::{MocError, MocResult};

/// Stable 16-byte identifier with canonical UUID and ULID string forms.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Id(Uuid);

impl Id {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn parse(value: &str) -> MocResult<Self> {
        if let Ok(uuid) = Uuid::parse_str(value) {
            return Ok(Self(uuid));
        }
        if let Ok(ulid) = ulid::Ulid::from_string(value) {
            return Ok(Self(Uuid::from_bytes(ulid.to_bytes())));
        }
        Err(MocError::format(format!("invalid id '{value}'")))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    pub fn as_vec(self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    pub fn as_uuid(self) -> Uuid {
        self.0
    }

    pub fn to_ulid_string(self) -> String {
        ulid::Ulid::from_bytes(*self.0.as_bytes()).to_string()
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Id::parse(&value).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CollectionId(pub Id);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChangesetId(pub Id);

macro_rules! id_wrapper_serde {
    ($name:ident) => {
        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                self.0.serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                Ok(Self(Id::deserialize(deserializer)?))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_wrapper_serde!(CollectionId);
id_wrapper_serde!(ChangesetId);

#[cfg(test)]
mod tests {
    use super::Id;

    #[test]
    fn id_parses_both_string_forms() {
        let id = Id::new();
        let from_uuid = Id::parse(&id.to_string()).expect("uuid form");
        let from_ulid = Id::parse(&id.to_ulid_string()).expect("ulid form");
        assert_eq!(from_uuid, id);
        assert_eq!(from_ulid, id);
    }

    #[test]
    fn id_rejects_garbage() {
        assert!(Id::parse("not-an-id").is_err());
        assert!(Id::parse("").is_err());
    }
}
