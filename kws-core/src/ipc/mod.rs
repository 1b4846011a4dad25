//! Event types broadcast to subscribers of a running recognizer.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a host can
//! forward them as JSON without mirroring them.

pub mod events;
