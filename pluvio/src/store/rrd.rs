//! `rrdtool` backed store client.
//!
//! Drives the `rrdtool` command-line client as a child process per
//! operation -- `info`, `last`, `fetch`, `update` -- and parses its text
//! output. The round-robin file itself, its retention and its consolidation
//! setup belong to the store; this client never creates or alters it.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::process::Command;
use tracing::debug;

use super::{Error, Fetched, Row, Series};

/// Store client backed by the `rrdtool` binary.
#[derive(Debug)]
pub struct RrdTool {
    binary: PathBuf,
    file: PathBuf,
    /// Opt-in ceiling on each client invocation. `None` preserves the
    /// default behavior of waiting indefinitely.
    timeout: Option<Duration>,
    /// The file's update step never changes after creation, so it is read
    /// once and cached.
    step: OnceLock<i64>,
}

impl RrdTool {
    /// Create a new [`RrdTool`] for the given round-robin file.
    #[must_use]
    pub fn new(binary: PathBuf, file: PathBuf, timeout: Option<Duration>) -> Self {
        Self {
            binary,
            file,
            timeout,
            step: OnceLock::new(),
        }
    }

    async fn run(&self, command: &'static str, args: Vec<OsString>) -> Result<String, Error> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(command)
            .arg(&self.file)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| Error::Timeout { command, timeout })?,
            None => cmd.output().await,
        }
        .map_err(|source| Error::Unavailable {
            binary: self.binary.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(Error::Command {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn step(&self) -> Result<i64, Error> {
        if let Some(step) = self.step.get() {
            return Ok(*step);
        }
        let text = self.run("info", Vec::new()).await?;
        let step = parse_step(&text)?;
        // A racing caller may have set it first; both parsed the same file.
        let _ = self.step.set(step);
        Ok(step)
    }
}

#[async_trait]
impl Series for RrdTool {
    async fn data_sources(&self) -> Result<Vec<String>, Error> {
        let text = self.run("info", Vec::new()).await?;
        parse_data_sources(&text)
    }

    async fn last_update(&self) -> Result<i64, Error> {
        let text = self.run("last", Vec::new()).await?;
        text.trim().parse().map_err(|_| Error::Parse {
            command: "last",
            detail: format!("expected an epoch timestamp, got {:?}", text.trim()),
        })
    }

    async fn next_update(&self) -> Result<i64, Error> {
        let last = self.last_update().await?;
        let step = self.step().await?;
        Ok(last + step)
    }

    async fn fetch(&self, start: i64, end: i64) -> Result<Fetched, Error> {
        let args = vec![
            OsString::from("AVERAGE"),
            OsString::from("-s"),
            OsString::from(start.to_string()),
            OsString::from("-e"),
            OsString::from(end.to_string()),
        ];
        let text = self.run("fetch", args).await?;
        parse_fetch(&text)
    }

    async fn update(&self, values: &FxHashMap<String, f64>) -> Result<(), Error> {
        let Some((template, sample)) = update_args(values) else {
            debug!("no known values this cycle; store write skipped");
            return Ok(());
        };
        let args = vec![
            OsString::from("--template"),
            OsString::from(template),
            OsString::from(sample),
        ];
        self.run("update", args).await.map(|_| ())
    }
}

fn parse_step(text: &str) -> Result<i64, Error> {
    text.lines()
        .find_map(|line| line.trim().strip_prefix("step = "))
        .and_then(|step| step.trim().parse().ok())
        .ok_or_else(|| Error::Parse {
            command: "info",
            detail: "no step line found".to_string(),
        })
}

/// Extract data source names from `info` output, ordered by the store's
/// own column index. Lines of interest look like `ds[precip_rate].index = 0`.
fn parse_data_sources(text: &str) -> Result<Vec<String>, Error> {
    let mut indexed: Vec<(i64, String)> = Vec::new();
    for line in text.lines() {
        let Some(rest) = line.trim().strip_prefix("ds[") else {
            continue;
        };
        let Some((name, attribute)) = rest.split_once(']') else {
            continue;
        };
        if let Some(index) = attribute.strip_prefix(".index = ") {
            let index = index.trim().parse().map_err(|_| Error::Parse {
                command: "info",
                detail: format!("unreadable index for data source {name}"),
            })?;
            indexed.push((index, name.to_string()));
        }
    }
    if indexed.is_empty() {
        return Err(Error::Parse {
            command: "info",
            detail: "no data sources found".to_string(),
        });
    }
    indexed.sort();
    Ok(indexed.into_iter().map(|(_, name)| name).collect())
}

/// Parse `fetch` output: a whitespace-separated header of field names, a
/// blank line, then one `timestamp: value value ...` row per step. The
/// store prints `nan` for missing values.
fn parse_fetch(text: &str) -> Result<Fetched, Error> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    let names: Vec<String> = lines
        .next()
        .ok_or_else(|| Error::Parse {
            command: "fetch",
            detail: "empty response".to_string(),
        })?
        .split_whitespace()
        .map(String::from)
        .collect();

    let mut rows = Vec::new();
    for line in lines {
        let (timestamp, rest) = line.split_once(':').ok_or_else(|| Error::Parse {
            command: "fetch",
            detail: format!("row without a timestamp: {line:?}"),
        })?;
        let timestamp = timestamp.trim().parse().map_err(|_| Error::Parse {
            command: "fetch",
            detail: format!("unreadable timestamp: {:?}", timestamp.trim()),
        })?;

        let mut values = Vec::with_capacity(names.len());
        for column in rest.split_whitespace() {
            let value: f64 = column.parse().map_err(|_| Error::Parse {
                command: "fetch",
                detail: format!("unreadable value: {column:?}"),
            })?;
            values.push(if value.is_nan() { None } else { Some(value) });
        }
        if values.len() != names.len() {
            return Err(Error::Parse {
                command: "fetch",
                detail: format!(
                    "row has {} values for {} fields",
                    values.len(),
                    names.len()
                ),
            });
        }
        rows.push(Row { timestamp, values });
    }

    Ok(Fetched { names, rows })
}

/// Build the `--template` field list and the `N:`-timestamped sample for an
/// update. Fields are written in name order; an empty map means there is
/// nothing to write.
fn update_args(values: &FxHashMap<String, f64>) -> Option<(String, String)> {
    if values.is_empty() {
        return None;
    }
    let mut names: Vec<&str> = values.keys().map(String::as_str).collect();
    names.sort_unstable();

    let template = names.join(":");
    let mut sample = String::from("N");
    for name in &names {
        sample.push(':');
        sample.push_str(&values[*name].to_string());
    }
    Some((template, sample))
}
