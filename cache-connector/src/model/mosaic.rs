use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully qualified mosaic identifier, `namespace:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MosaicId {
    pub namespace_id: String,
    pub name: String,
}

impl MosaicId {
    pub fn new(namespace_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace_id: namespace_id.into(),
            name: name.into(),
        }
    }

    pub fn is_xem(&self) -> bool {
        self.namespace_id == "nem" && self.name == "xem"
    }
}

impl fmt::Display for MosaicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace_id, self.name)
    }
}

/// Binds a mosaic id to its divisibility so relative amounts can be converted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDescriptor {
    pub mosaic_id: MosaicId,
    pub divisibility: u32,
}

impl TokenDescriptor {
    /// The native currency, `nem:xem`.
    pub fn xem() -> Self {
        Self {
            mosaic_id: MosaicId::new("nem", "xem"),
            divisibility: 6,
        }
    }

    /// The CACHE token.
    pub fn cache() -> Self {
        Self {
            mosaic_id: MosaicId::new("cache", "cache"),
            divisibility: 6,
        }
    }

    /// Converts a whole-unit amount into the absolute on-chain quantity.
    pub fn absolute(&self, relative: u64) -> u64 {
        relative.saturating_mul(10u64.saturating_pow(self.divisibility))
    }

    /// Creates a transferable mosaic of `relative` whole units.
    pub fn amount(&self, relative: u64) -> Mosaic {
        Mosaic::new(self.mosaic_id.clone(), self.absolute(relative))
    }

    /// Creates a transferable mosaic from an absolute quantity.
    pub fn from_absolute(&self, quantity: u64) -> Mosaic {
        Mosaic::new(self.mosaic_id.clone(), quantity)
    }
}

/// A quantity of some mosaic, in absolute units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mosaic {
    pub mosaic_id: MosaicId,
    pub quantity: u64,
}

impl Mosaic {
    pub fn new(mosaic_id: MosaicId, quantity: u64) -> Self {
        Self {
            mosaic_id,
            quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_amounts_scale_by_divisibility() {
        let cache = TokenDescriptor::cache();
        let three = cache.amount(3);
        assert_eq!(three.quantity, 3_000_000);
        assert_eq!(three.mosaic_id.to_string(), "cache:cache");
        assert!(!three.mosaic_id.is_xem());
        assert!(TokenDescriptor::xem().mosaic_id.is_xem());
    }

    #[test]
    fn wire_form_uses_camel_case() {
        let mosaic: Mosaic = serde_json::from_str(
            r#"{"quantity":5,"mosaicId":{"namespaceId":"cache","name":"cache"}}"#,
        )
        .unwrap();
        assert_eq!(mosaic, TokenDescriptor::cache().from_absolute(5));
    }
}
