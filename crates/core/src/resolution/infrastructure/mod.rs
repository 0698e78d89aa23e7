pub mod threaded_resolution_executor;
