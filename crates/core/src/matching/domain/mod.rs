pub mod identity_matcher;
pub mod similarity_log;
