pub mod conflict;
pub mod extract;
pub mod manager;
pub mod normalize;
pub mod score;
pub mod strategy;
