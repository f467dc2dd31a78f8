pub mod caption_service;
pub mod file_records;
pub mod scoped_client;
pub mod storage_provider;
pub mod supabase_storage;
pub mod vision;

#[cfg(test)]
pub mod testing;
