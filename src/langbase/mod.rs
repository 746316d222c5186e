//! Langbase Pipes client and wire types.

mod client;
mod types;


pub use client::LangbaseClient;
pub use types::*;
