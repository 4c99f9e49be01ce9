//! XML document model for service requests and replies.
//!
//! - [`Element`] - parsed or built element tree with path accessors
//! - [`XmlWriter`] - forward-only builder used to assemble requests
//!
//! Namespace prefixes in element names (`prefix:local`) are kept as
//! qualified names; lookups through a prefix that never appears in the
//! queried subtree find nothing.

mod element;
mod path;
mod writer;

pub use element::{Element, QName, DATE_FORMAT};
pub use writer::{XmlWriter, XML_DECLARATION};
