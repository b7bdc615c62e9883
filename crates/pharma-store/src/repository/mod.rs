//! # Repository Module
//!
//! SQL lives here and nowhere else.
//!
//! - [`KvRepository`](kv::KvRepository) - the `kv_entries` table

pub mod kv;
