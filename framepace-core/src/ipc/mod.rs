//! Event types published by a session over `tokio::sync::broadcast`.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! forward them as JSON without wrapping.

pub mod events;
