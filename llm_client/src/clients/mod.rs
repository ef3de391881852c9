//! Exposes all the clients which we are interested in, and a standardized format
//! so we can be happy while the provider client takes care of the details

pub mod lmstudio;
pub mod types;
