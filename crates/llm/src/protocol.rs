//! Wire types for the Anthropic Messages dialect spoken on the client edge.

pub mod anthropic;
mod unknown_fields;

pub use unknown_fields::UnknownFields;
