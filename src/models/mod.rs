//! Core data models for the captioning service.
//!
//! `UploadedFile` maps to the `uploaded_files` table via `sqlx::FromRow`; the
//! other types travel between storage, the vision client and the HTTP layer.

pub mod uploaded_file;
