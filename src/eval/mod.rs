pub mod condition;
pub mod details;
pub mod evaluator;
pub mod hashing;
