//! feedrelay-scheduler - daily jobs
//!
//! This crate provides:
//! - A wall-clock daily schedule in a configured timezone
//! - The daily per-destination digest job

pub mod daily;
pub mod digest;

pub use daily::{Clock, DailySchedule, next_occurrence, system_clock};
pub use digest::DailyDigest;
