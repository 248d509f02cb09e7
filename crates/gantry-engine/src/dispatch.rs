//! Dispatch ordering.
//!
//! Jobs with ready batches compete for agents. Higher schedule priority wins;
//! between equals the job that has been waiting longest goes first.

use gantry_core::job::Job;
use std::cmp::Ordering;

pub fn compare_dispatch_order(a: &Job, b: &Job) -> Ordering {
    match b.schedule_priority.cmp(&a.schedule_priority) {
        Ordering::Equal => a.created_at.cmp(&b.created_at),
        other => other,
    }
}
