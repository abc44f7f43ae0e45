//! Structured results logging: JSONL writer plus the logger thread.

pub mod activity;
pub mod jsonl;
