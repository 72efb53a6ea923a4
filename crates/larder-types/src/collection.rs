//! Collection names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One of the homogeneous record sets kept by the storage tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Customer orders.
    Orders,
    /// Dishes and drinks on the menu.
    MenuItems,
    /// Staff and customer accounts.
    Users,
}

impl Collection {
    /// Every collection, in a stable order.
    pub const ALL: [Collection; 3] = [Collection::Orders, Collection::MenuItems, Collection::Users];

    /// Stable lowercase name, used for file names and config keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Collection::Orders => "orders",
            Collection::MenuItems => "menu_items",
            Collection::Users => "users",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known collection.
#[derive(Debug, Clone, Error)]
#[error("unknown collection '{0}'")]
pub struct ParseCollectionError(pub String);

impl FromStr for Collection {
    type Err = ParseCollectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "orders" => Ok(Collection::Orders),
            "menu_items" | "menuitems" => Ok(Collection::MenuItems),
            "users" => Ok(Collection::Users),
            _ => Err(ParseCollectionError(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_aliases() {
        assert_eq!("orders".parse::<Collection>().unwrap(), Collection::Orders);
        assert_eq!("menu-items".parse::<Collection>().unwrap(), Collection::MenuItems);
        assert_eq!("MenuItems".parse::<Collection>().unwrap(), Collection::MenuItems);
        assert!("tables".parse::<Collection>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&Collection::MenuItems).unwrap();
        assert_eq!(json, "\"menu_items\"");
    }
}
