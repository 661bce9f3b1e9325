//! Ambient primitives shared by every crate in the workspace: the logging
//! facade re-export every other crate logs through.

pub use log::*;
