use crate::error::ModelError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

const ADDRESS_LEN: usize = 40;

/// The NEM network an address belongs to, derived from its first character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkType {
    MainNet,
    TestNet,
    Mijin,
}

impl NetworkType {
    /// The version byte NIS uses for this network.
    pub fn version_byte(self) -> u8 {
        match self {
            NetworkType::MainNet => 0x68,
            NetworkType::TestNet => 0x98,
            NetworkType::Mijin => 0x60,
        }
    }
}

/// A NEM account address in its plain (dash-free, upper-case) base32 form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    /// Parses an address, accepting both the plain and the dashed ("pretty") form.
    pub fn new(raw: &str) -> Result<Self, ModelError> {
        let plain: String = raw
            .trim()
            .chars()
            .filter(|c| *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();

        let valid_charset = plain
            .chars()
            .all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c));
        if plain.len() != ADDRESS_LEN || !valid_charset {
            return Err(ModelError::InvalidAddress(raw.to_string()));
        }
        if network_of(&plain).is_none() {
            return Err(ModelError::InvalidAddress(raw.to_string()));
        }
        Ok(Self(plain))
    }

    /// Builds an address from a raw object received from an outside source.
    ///
    /// Accepts either a bare string or an object carrying the address in its
    /// `value` field.
    pub fn cast(raw: &Value) -> Result<Self, ModelError> {
        match raw {
            Value::String(s) => Self::new(s),
            Value::Object(map) => match map.get("value") {
                Some(Value::String(s)) => Self::new(s),
                Some(_) => Err(ModelError::InvalidField { field: "value" }),
                None => Err(ModelError::MissingField("value")),
            },
            _ => Err(ModelError::InvalidField { field: "address" }),
        }
    }

    pub fn plain(&self) -> &str {
        &self.0
    }

    /// The dashed form, grouped by six characters.
    pub fn pretty(&self) -> String {
        self.0
            .as_bytes()
            .chunks(6)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join("-")
    }

    pub fn network(&self) -> NetworkType {
        // validated in `new`
        network_of(&self.0).unwrap_or(NetworkType::TestNet)
    }
}

fn network_of(plain: &str) -> Option<NetworkType> {
    match plain.as_bytes().first() {
        Some(b'N') => Some(NetworkType::MainNet),
        Some(b'T') => Some(NetworkType::TestNet),
        Some(b'M') => Some(NetworkType::Mijin),
        _ => None,
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::new(&s).map_err(serde::de::Error::custom)
    }
}
