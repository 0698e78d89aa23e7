pub mod bounding_box;
pub mod category;
pub mod config;
pub mod constants;
pub mod crop;
pub mod detection;
pub mod embedding;
pub mod identity;
pub mod ids;
pub mod photo;
