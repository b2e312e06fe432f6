//! Slidecount - Sliding Window Request Accounting
//!
//! This crate tracks how many requests each key has made in the current and
//! the previous fixed-length window, and turns those two counts into a
//! smoothed rate estimate for admission control. Counters sit behind the
//! [`ratelimit::LimitCounter`] trait so that an in-process counter and a
//! shared-store counter are interchangeable.

pub mod config;
pub mod error;
pub mod ratelimit;
