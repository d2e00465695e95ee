//! XML plumbing shared by composers, the builder and the resolver.

pub mod dom;
pub mod locator;
pub mod namespace;

pub use dom::{NodeId, NodeKind, XmlDocument, DOCUMENT_NODE};
pub use locator::Locator;
pub use namespace::NamespaceContext;
