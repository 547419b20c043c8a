//! GPIO daemon client feeding the rain gauge.
//!
//! The gauge pin is owned by the host's pigpio daemon; this module speaks
//! its socket interface. One connection carries the 16-byte little-endian
//! command words that configure the pin and the notification subscription,
//! a second connection streams 12-byte level reports. Each report carries a
//! wrapping microsecond tick and the level word for GPIO 0-31; transitions
//! of the watched pin are handed to [`RainGauge::on_edge`] with that tick.
//!
//! ## Metrics
//!
//! `gpio_reports`: Level reports decoded from the daemon

use std::sync::Arc;

use bytes::{Buf, BytesMut};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::gauge::RainGauge;

/// Set the functional mode of a pin.
const CMD_MODES: u32 = 0;
/// Set a pin's pull-up/down resistor.
const CMD_PUD: u32 = 2;
/// Begin notifications on an open handle.
const CMD_NB: u32 = 19;
/// Close a notification handle.
const CMD_NC: u32 = 21;
/// Open a notification handle bound to the requesting connection.
const CMD_NOIB: u32 = 99;

const PIN_MODE_INPUT: u32 = 0;
const PULL_UP: u32 = 2;

/// Wire size of one level report.
const REPORT_BYTES: usize = 12;

/// Errors produced by [`Monitor`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The daemon could not be reached.
    #[error("could not connect to GPIO daemon at {addr}: {source}")]
    Connect {
        /// Daemon address.
        addr: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// IO error on an established daemon connection.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The daemon rejected a command.
    #[error("GPIO daemon rejected {command}: error code {code}")]
    Daemon {
        /// The rejected command.
        command: &'static str,
        /// The daemon's error code.
        code: i32,
    },
    /// Level reports cover GPIO 0 through 31 only.
    #[error("pin {pin} cannot be watched, level reports carry GPIO 0-31")]
    PinOutOfRange {
        /// The configured pin.
        pin: u8,
    },
    /// The daemon closed the notification stream.
    #[error("GPIO daemon closed the notification stream")]
    Disconnected,
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
/// Which signal transition counts as a gauge tick.
pub enum Edge {
    /// High to low. A reed switch pulling a pulled-up pin to ground tips
    /// this way.
    #[default]
    Falling,
    /// Low to high.
    Rising,
}

impl Edge {
    /// Whether the watched bit transitioned this way between two level
    /// words.
    #[must_use]
    fn triggered(self, previous: u32, current: u32, mask: u32) -> bool {
        match self {
            Self::Falling => previous & mask != 0 && current & mask == 0,
            Self::Rising => previous & mask == 0 && current & mask != 0,
        }
    }
}

/// One decoded level report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Report {
    seqno: u16,
    flags: u16,
    tick: u32,
    level: u32,
}

impl Report {
    fn decode(mut bytes: impl Buf) -> Self {
        Self {
            seqno: bytes.get_u16_le(),
            flags: bytes.get_u16_le(),
            tick: bytes.get_u32_le(),
            level: bytes.get_u32_le(),
        }
    }
}

fn encode_command(cmd: u32, p1: u32, p2: u32) -> [u8; 16] {
    let mut word = [0u8; 16];
    word[0..4].copy_from_slice(&cmd.to_le_bytes());
    word[4..8].copy_from_slice(&p1.to_le_bytes());
    word[8..12].copy_from_slice(&p2.to_le_bytes());
    word
}

async fn command(
    stream: &mut TcpStream,
    name: &'static str,
    cmd: u32,
    p1: u32,
    p2: u32,
) -> Result<i32, Error> {
    stream.write_all(&encode_command(cmd, p1, p2)).await?;
    let mut reply = [0u8; 16];
    stream.read_exact(&mut reply).await?;
    let result = i32::from_le_bytes(reply[12..16].try_into().expect("reply slice is four bytes"));
    if result < 0 {
        return Err(Error::Daemon {
            command: name,
            code: result,
        });
    }
    Ok(result)
}

/// The GPIO edge monitor.
///
/// Configures the gauge pin, subscribes to level notifications and feeds
/// transitions to the gauge until shutdown. Runs as a background task
/// beside the measurement cycle.
#[derive(Debug)]
pub struct Monitor {
    addr: String,
    pin: u8,
    edge: Edge,
    gauge: Arc<RainGauge>,
    shutdown: pluvio_signal::Watcher,
}

impl Monitor {
    /// Create a new [`Monitor`].
    ///
    /// # Errors
    ///
    /// Function will return an error if the pin cannot appear in level
    /// reports.
    pub fn new(
        addr: String,
        pin: u8,
        edge: Edge,
        gauge: Arc<RainGauge>,
        shutdown: pluvio_signal::Watcher,
    ) -> Result<Self, Error> {
        if pin > 31 {
            return Err(Error::PinOutOfRange { pin });
        }
        Ok(Self {
            addr,
            pin,
            edge,
            gauge,
            shutdown,
        })
    }

    /// Run this [`Monitor`] until shutdown.
    ///
    /// # Errors
    ///
    /// Function will return an error if the daemon cannot be reached,
    /// rejects the pin setup, or drops the notification stream.
    #[allow(clippy::cast_sign_loss)]
    pub async fn spin(mut self) -> Result<(), Error> {
        let mut control = self.connect().await?;
        command(&mut control, "modes", CMD_MODES, u32::from(self.pin), PIN_MODE_INPUT).await?;
        command(&mut control, "pud", CMD_PUD, u32::from(self.pin), PULL_UP).await?;

        let mut reports = self.connect().await?;
        let handle = command(&mut reports, "noib", CMD_NOIB, 0, 0).await? as u32;
        let mask = 1u32 << self.pin;
        command(&mut control, "nb", CMD_NB, handle, mask).await?;
        info!(
            addr = %self.addr,
            pin = self.pin,
            edge = ?self.edge,
            "watching rain gauge pin"
        );

        let mut buf = BytesMut::with_capacity(256);
        let mut previous_level: Option<u32> = None;
        loop {
            tokio::select! {
                read = reports.read_buf(&mut buf) => {
                    if read? == 0 {
                        return Err(Error::Disconnected);
                    }
                    while buf.len() >= REPORT_BYTES {
                        let report = Report::decode(buf.split_to(REPORT_BYTES));
                        counter!("gpio_reports").increment(1);
                        if report.flags != 0 {
                            // Keepalive and watchdog reports carry no level
                            // change.
                            debug!(seqno = report.seqno, flags = report.flags, "non-level report skipped");
                            continue;
                        }
                        if let Some(previous) = previous_level
                            && self.edge.triggered(previous, report.level, mask)
                        {
                            self.gauge.on_edge(report.tick);
                        }
                        previous_level = Some(report.level);
                    }
                }
                () = self.shutdown.recv() => {
                    // Best effort: the daemon reaps the handle on disconnect
                    // anyway.
                    let _ = command(&mut control, "nc", CMD_NC, handle, 0).await;
                    info!("shutdown signal received");
                    return Ok(());
                }
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream, Error> {
        debug!(addr = %self.addr, "connecting to GPIO daemon");
        TcpStream::connect(&self.addr)
            .await
            .map_err(|source| Error::Connect {
                addr: self.addr.clone(),
                source,
            })
    }
}
