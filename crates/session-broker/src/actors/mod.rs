//! Actor hierarchy: registry → rooms, plus one connection actor per peer.

pub mod connection;
pub mod messages;
pub mod registry;
pub mod room;
