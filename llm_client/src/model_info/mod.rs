//! Model metadata we need before talking to a model, mostly how large its
//! context window is.

pub mod cache;
pub mod types;
