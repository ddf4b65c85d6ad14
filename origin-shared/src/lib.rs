#![warn(rust_2018_idioms)]

pub mod context;
pub mod error;
pub mod fragment;

pub use context::{current_cid, generate_cid, ContextId, ContextScope};
