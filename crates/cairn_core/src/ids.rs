use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::{GraphError, GraphResult};

/// Globally unique identifier of one element or relationship for its whole
/// lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    pub fn new() -> Self {
        Self(*Uuid::new_v4().as_bytes())
    }

    pub fn from_uuid_str(value: &str) -> GraphResult<Self> {
        let uuid = Uuid::parse_str(value)
            .map_err(|err| GraphError::invalid(format!("invalid guid '{value}': {err}")))?;
        Ok(Self(*uuid.as_bytes()))
    }

    pub fn from_ulid_str(value: &str) -> GraphResult<Self> {
        let ulid = ulid::Ulid::from_string(value)
            .map_err(|err| GraphError::invalid(format!("invalid ulid '{value}': {err}")))?;
        Ok(Self(ulid.to_bytes()))
    }

    pub fn to_uuid_string(self) -> String {
        Uuid::from_bytes(self.0).to_string()
    }

    pub fn as_bytes(self) -> [u8; 16] {
        self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl Default for Guid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uuid = Uuid::from_bytes(self.0);
        write!(f, "{uuid}")
    }
}

impl FromStr for Guid {
    type Err = GraphError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Guid::from_uuid_str(value).or_else(|_| Guid::from_ulid_str(value))
    }
}

impl Serialize for Guid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_uuid_string())
    }
}

impl<'de> Deserialize<'de> for Guid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse::<Guid>()
            .map_err(|_| serde::de::Error::custom("invalid guid string"))
    }
}

#[cfg(test)]
mod tests {
    use super::Guid;

    #[test]
    fn guid_parses_uuid_and_ulid_text() {
        let guid = Guid::new();
        let parsed: Guid = guid.to_uuid_string().parse().expect("uuid parse");
        assert_eq!(parsed, guid);
        let ulid = ulid::Ulid::from_bytes(guid.as_bytes()).to_string();
        let from_ulid = Guid::from_ulid_str(&ulid).expect("ulid parse");
        assert_eq!(from_ulid, guid);
    }

    #[test]
    fn guid_rejects_invalid_strings() {
        assert!("not-a-guid".parse::<Guid>().is_err());
        assert!(Guid::from_ulid_str("not-a-ulid").is_err());
    }

    #[test]
    fn guid_serializes_as_uuid_text() {
        let guid = Guid::new();
        let encoded = serde_json::to_string(&guid).expect("encode");
        assert_eq!(encoded, format!("\"{guid}\""));
        let decoded: Guid = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, guid);
    }
}
