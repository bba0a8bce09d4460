//! Streaming keyed aggregation.
//!
//! A [`table::KeyedTable`] maps keys to accumulator records; a
//! [`report::ReportCycle`] drains it every interval. The `top`,
//! `hrcount` and `stat` aggregators are the three concrete analyses
//! built on them.

pub mod accumulator;
pub mod hrcount;
pub mod latency;
pub mod rank;
pub mod report;
pub mod stat;
pub mod table;
pub mod top;
