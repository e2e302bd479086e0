//! Shared registries for live connections and room membership.

pub mod connection;
pub mod room;

pub use connection::{ConnectionRegistry, RegisterOutcome};
pub use room::RoomRegistry;
