pub mod burst;
pub mod dedup;
pub mod embedding;
pub mod matching;
pub mod resolution;
pub mod shared;
pub mod store;
