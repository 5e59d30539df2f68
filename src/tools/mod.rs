//! Wrappers around the external tools which do the actual transformation
//! work. Each wrapper turns tool output into a [`ToolError`](crate::ToolError)
//! carrying a message and, where the tool reports one, a source location.

pub mod copy;
pub mod lint;
pub mod process;
pub mod scripts;
pub mod styles;
