//! Notes module
//!
//! Provides the note record, its single-field update vocabulary and the
//! request DTO used by the HTTP create endpoint.

pub mod models;

pub use models::*;
