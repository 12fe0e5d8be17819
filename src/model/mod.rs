//! Data carried across the client/service boundary.

mod event;
mod message;
mod process;
mod resolution;

pub use event::*;
pub use message::*;
pub use process::*;
pub use resolution::*;
