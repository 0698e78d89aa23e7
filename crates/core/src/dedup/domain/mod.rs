pub mod frame_deduplicator;
