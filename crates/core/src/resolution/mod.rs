pub mod deduplicate_photo_use_case;
pub mod infrastructure;
pub mod merge_identities_use_case;
pub mod resolution_executor;
pub mod resolution_logger;
pub mod resolution_outcome;
pub mod resolve_detection_use_case;
pub mod retry;
pub mod unresolve_use_case;
