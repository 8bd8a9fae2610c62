pub mod core;
pub mod mapping;
pub mod stats_models;
