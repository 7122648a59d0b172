pub mod context;
pub mod value;

pub use context::{Document, DocumentContext, SubspaceContext, SYNTHESIZED_SCAN_ID};
pub use value::DataValue;
