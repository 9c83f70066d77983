pub mod catalog;
pub mod chain;
pub mod marker;
pub mod parse;

pub use catalog::{CatalogError, MarkerCatalog};
pub use chain::{CallChain, Frame};
pub use marker::{MarkerId, MarkerKind, Signature};
pub use parse::{parse, parse_bytes, parse_partial, scan_line, ParsedTrace};
