//! imgsim-daemon: line-oriented TCP command server for imgsim databases.
//!
//! Exposes the engine's operations (add, remove, query, similarity,
//! maintenance) over a simple numbered-reply protocol, serving several
//! databases addressed by dbid.

pub mod protocol;
pub mod server;

pub use protocol::{parse, Command, QueryModifiers};
pub use server::Server;
