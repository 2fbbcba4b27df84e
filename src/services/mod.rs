pub mod blob_stream;
pub mod classifier;
pub mod counter;
pub mod document_store;
pub mod event_filter;
pub mod fan_out;
pub mod moderation;
pub mod storage_service;
pub mod transform;
