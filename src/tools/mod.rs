pub mod agent;
pub mod base;
pub mod github;
pub mod registry;
pub mod webhook;

pub use base::{Invocation, ToolAdapter, ToolDescriptor, ToolFilter};
pub use registry::ToolRegistry;
