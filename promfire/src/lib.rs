//! The promfire Prometheus replication benchmark.
//!
//! This library supports the promfire binary found elsewhere in this project.
//! It reads the metrics a Prometheus-compatible backend already holds and
//! writes them back as new series, under replica label sets and at a
//! controlled rate, to load the backend's remote-write ingestion path.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod api;
pub mod catalog;
pub mod config;
pub mod labels;
pub mod proto;
pub mod query;
pub mod rate;
pub mod replicator;
pub mod timestamp;
pub mod writer;
