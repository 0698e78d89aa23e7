pub mod jsonl_similarity_log;
