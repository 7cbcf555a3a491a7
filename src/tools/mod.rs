pub mod handler;
pub mod registry;

pub use handler::{ToolDef, ToolHandler};
pub use registry::ToolRegistry;
