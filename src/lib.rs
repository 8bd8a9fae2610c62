// src/lib.rs
pub mod error;
pub mod matching;
pub mod models;
pub mod store;
pub mod utils;

pub use error::{ReconError, ReconResult};
pub use matching::manager::Reconciler;
