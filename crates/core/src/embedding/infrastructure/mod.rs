pub mod execution_provider;
pub mod extractor_registry;
pub mod image_crop_source;
pub mod model_resolver;
pub mod onnx_embedding_extractor;
