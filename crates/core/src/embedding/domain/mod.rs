pub mod crop_source;
pub mod embedding_extractor;
pub mod extractor_set;
