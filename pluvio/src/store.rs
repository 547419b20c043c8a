//! Interface to the round-robin time-series store.
//!
//! The store owns durable history and its native update cadence; the
//! station only queries and appends through the narrow surface of
//! [`Series`]. The one production implementation drives the `rrdtool`
//! command-line client, see [`rrd`].

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

pub mod rrd;

/// Errors produced by store implementations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The store client could not be reached or launched at all.
    #[error("could not run store client {binary:?}: {source}")]
    Unavailable {
        /// The client binary.
        binary: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The store rejected a command.
    #[error("store {command} command failed: {stderr}")]
    Command {
        /// The store command that failed.
        command: &'static str,
        /// What the store said about it.
        stderr: String,
    },
    /// The store's response could not be understood.
    #[error("could not parse store {command} output: {detail}")]
    Parse {
        /// The store command whose output was malformed.
        command: &'static str,
        /// Parse failure detail.
        detail: String,
    },
    /// The opt-in I/O timeout elapsed.
    #[error("store {command} command timed out after {timeout:?}")]
    Timeout {
        /// The store command that timed out.
        command: &'static str,
        /// The configured timeout.
        timeout: Duration,
    },
}

/// One stored sample: a timestamp and a value per data source, in the
/// field order of [`Fetched::names`]. A `None` is the store's own
/// missing-value marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Entry timestamp, epoch seconds.
    pub timestamp: i64,
    /// Per-field values, `None` where the store holds no data.
    pub values: Vec<Option<f64>>,
}

/// An ordered slice of store history.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    /// Field names, one per value column.
    pub names: Vec<String>,
    /// Samples, oldest first.
    pub rows: Vec<Row>,
}

/// The narrow query/append surface of the time-series store.
#[async_trait]
pub trait Series {
    /// The data source (field) names the store is defined with.
    async fn data_sources(&self) -> Result<Vec<String>, Error>;

    /// Timestamp of the most recent stored entry, epoch seconds.
    async fn last_update(&self) -> Result<i64, Error>;

    /// The store's next native update instant, epoch seconds. The
    /// measurement cycle phase-locks to this; it is never invented
    /// client-side.
    async fn next_update(&self) -> Result<i64, Error>;

    /// Samples between `start` and `end` (epoch seconds), oldest first.
    async fn fetch(&self, start: i64, end: i64) -> Result<Fetched, Error>;

    /// Append `values` at the store's notion of now. Fields absent from
    /// `values` are recorded by the store as missing, not as zero.
    async fn update(&self, values: &FxHashMap<String, f64>) -> Result<(), Error>;
}
