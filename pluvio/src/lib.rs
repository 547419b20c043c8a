//! The pluvio rain-gauge acquisition station.
//!
//! This library supports the pluviod binary found elsewhere in this
//! project: it counts debounced tips of a tipping-bucket rain gauge,
//! converts them to a precipitation rate once per store update step and
//! maintains a validated daily accumulated total in an external
//! round-robin time-series store. The bits and pieces here are not
//! intended to be used outside of supporting pluviod, although if they are
//! helpful in other domains that's a nice surprise.

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
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod cycle;
pub mod gauge;
pub mod gpio;
pub mod reconcile;
pub mod store;
