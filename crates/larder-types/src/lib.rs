//! # Larder Types
//!
//! Data model shared by every layer of the Larder storage tier.
//!
//! - [`Collection`] names the three operational datasets (orders, menu items, users)
//! - [`Record`] is a JSON document with an immutable [`RecordId`] and creation [`Timestamp`]
//! - [`Filter`] describes equality/range predicates evaluated by stores or client-side
//! - [`SortKey`] is the total order every listing follows
//!
//! ## Example
//!
//! ```rust
//! use larder_types::{Collection, Filter, Record};
//! use serde_json::json;
//!
//! let record = Record::from_value(json!({ "table": 4, "status": "open" })).unwrap();
//! let filter = Filter::new().where_eq("status", json!("open"));
//! assert!(filter.matches(&record));
//! assert_eq!(Collection::Orders.as_str(), "orders");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod collection;
mod filter;
mod record;
mod timestamp;

pub use collection::{Collection, ParseCollectionError};
pub use filter::{Condition, Filter, FilterSupport, SortOrder};
pub use record::{Fields, Record, RecordId, SortKey};
pub use timestamp::Timestamp;
