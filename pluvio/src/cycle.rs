//! The measurement cycle.
//!
//! One iteration per store-native step: wait for the store's next update
//! instant, drain the gauge, derive the rate, reconcile the daily total
//! against stored history and append the result. The loop stays
//! phase-locked to the store's cadence -- it never invents a polling
//! interval of its own -- and runs until shutdown.
//!
//! Failure handling splits two ways. Anything that would desynchronize the
//! loop or indicates a broken setup is fatal: the startup schema check and
//! the next-update query. Everything inside a running cycle degrades
//! instead: a failed history fetch or a mismatched total yields an unknown
//! accumulation, a failed write is logged and the next cycle re-derives a
//! fresh value anyway.
//!
//! ## Metrics
//!
//! `cycles_completed`: Measurement cycles run to the persistence step
//! `daily_resets`: Cycles that restarted accumulation at the boundary
//! `reconcile_unknown`: Cycles whose total could not be trusted
//! `store_write_failures`: Persistence attempts the store rejected

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info};

use crate::gauge::RainGauge;
use crate::reconcile::{Accumulation, DayHistory, Reconciler, ResetBoundary, round_display};
use crate::store::{self, Series};

/// Errors produced by [`Station`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The store's schema does not match the configured one.
    #[error("store data sources {actual:?} do not match configured set {expected:?}")]
    SchemaMismatch {
        /// Data sources the configuration expects.
        expected: Vec<String>,
        /// Data sources the store is defined with.
        actual: Vec<String>,
    },
    /// See [`crate::store::Error`] for details.
    #[error(transparent)]
    Store(#[from] store::Error),
}

/// Field names the station reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Field holding the per-cycle precipitation rate.
    pub rate_field: String,
    /// Field holding the daily accumulated total.
    pub total_field: String,
    /// Every data source the store is expected to define.
    pub data_sources: Vec<String>,
}

/// The measurement-cycle server.
#[derive(Debug)]
pub struct Station<S> {
    store: S,
    gauge: Arc<RainGauge>,
    reconciler: Reconciler,
    boundary: ResetBoundary,
    schema: Schema,
    shutdown: pluvio_signal::Watcher,
}

impl<S> Station<S>
where
    S: Series,
{
    /// Create a new [`Station`].
    #[must_use]
    pub fn new(
        store: S,
        gauge: Arc<RainGauge>,
        reconciler: Reconciler,
        boundary: ResetBoundary,
        schema: Schema,
        shutdown: pluvio_signal::Watcher,
    ) -> Self {
        Self {
            store,
            gauge,
            reconciler,
            boundary,
            schema,
            shutdown,
        }
    }

    /// Run this [`Station`] to completion or until a shutdown signal is
    /// received.
    ///
    /// # Errors
    ///
    /// Function will return an error if the store schema does not match the
    /// configuration or if the store cannot be queried for its update
    /// cadence.
    pub async fn spin(mut self) -> Result<(), Error> {
        self.verify_schema().await?;

        loop {
            let wake = self.store.next_update().await?;
            if self.shutdown.try_recv() {
                break;
            }
            self.wait_until(wake).await;
            if self.shutdown.try_recv() {
                break;
            }
            self.cycle().await;
            counter!("cycles_completed").increment(1);
        }
        info!("shutdown signal received");
        Ok(())
    }

    /// Compare the store's data sources against the configured set,
    /// order-insensitively. Acquiring against a store whose layout drifted
    /// from the configuration would persist fields into the wrong columns.
    async fn verify_schema(&self) -> Result<(), Error> {
        let mut actual = self.store.data_sources().await?;
        let mut expected = self.schema.data_sources.clone();
        actual.sort();
        expected.sort();
        if actual != expected {
            return Err(Error::SchemaMismatch { expected, actual });
        }
        info!(data_sources = ?actual, "store schema verified");
        Ok(())
    }

    /// Block until the store's update instant, or return immediately if it
    /// has already passed.
    #[allow(clippy::cast_sign_loss)]
    async fn wait_until(&mut self, wake: i64) {
        let remaining = wake - Utc::now().timestamp();
        if remaining <= 0 {
            debug!(wake, "store update instant already reached");
            return;
        }
        debug!(wake, seconds = remaining, "sleeping until next store update");
        tokio::select! {
            () = sleep(Duration::from_secs(remaining as u64)) => {}
            () = self.shutdown.recv() => {}
        }
    }

    async fn cycle(&mut self) {
        let loop_start = Utc::now();
        let ticks = self.gauge.drain();
        let rate = self.reconciler.rate(ticks);
        info!(start = %loop_start, ticks, rate, "measurement cycle started");

        let total = self.accumulate(loop_start, rate).await;

        let mut values = FxHashMap::default();
        values.insert(self.schema.rate_field.clone(), round_display(rate));
        if let Accumulation::Known(total) = total {
            values.insert(self.schema.total_field.clone(), round_display(total));
        }
        match self.store.update(&values).await {
            Ok(()) => info!(?values, "store updated"),
            Err(err) => {
                counter!("store_write_failures").increment(1);
                error!(err = %err, ?values, "store write failed; continuing");
            }
        }
    }

    /// Derive this cycle's accumulated total: the validated previous total
    /// plus the current rate, zero-based after the daily boundary, or
    /// unknown when the history cannot be trusted.
    async fn accumulate(&mut self, loop_start: DateTime<Utc>, rate: f64) -> Accumulation {
        let last_entry = match self.store.last_update().await {
            Ok(timestamp) => timestamp,
            Err(err) => {
                error!(err = %err, "could not read last store entry time; total is unknown");
                counter!("reconcile_unknown").increment(1);
                return Accumulation::Unknown;
            }
        };
        let Some(last_entry_time) = DateTime::from_timestamp(last_entry, 0) else {
            error!(last_entry, "last store entry time is unrepresentable; total is unknown");
            counter!("reconcile_unknown").increment(1);
            return Accumulation::Unknown;
        };

        let crossing = self.boundary.previous_crossing(loop_start);
        if self.boundary.reset_due(loop_start, last_entry_time) {
            info!(
                %crossing,
                %last_entry_time,
                "last entry predates the reset boundary; accumulation restarts"
            );
            counter!("daily_resets").increment(1);
            return Accumulation::Known(rate);
        }

        let fetched = match self.store.fetch(crossing.timestamp(), last_entry).await {
            Ok(fetched) => fetched,
            Err(err) => {
                error!(err = %err, "could not fetch today's history; total is unknown");
                counter!("reconcile_unknown").increment(1);
                return Accumulation::Unknown;
            }
        };
        let history = match DayHistory::from_fetched(
            &fetched,
            &self.schema.rate_field,
            &self.schema.total_field,
        ) {
            Ok(history) => history,
            Err(err) => {
                error!(err = %err, "fetched history is unusable; total is unknown");
                counter!("reconcile_unknown").increment(1);
                return Accumulation::Unknown;
            }
        };

        let total = self.reconciler.compose(rate, &history);
        if total == Accumulation::Unknown {
            counter!("reconcile_unknown").increment(1);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{Timelike, Utc};
    use rustc_hash::FxHashMap;

    use super::{Error, Schema, Station};
    use crate::gauge::RainGauge;
    use crate::reconcile::{Reconciler, ResetBoundary};
    use crate::store::{self, Fetched, Row, Series};

    #[derive(Debug, Default)]
    struct FakeSeries {
        sources: Vec<String>,
        last_update: i64,
        next_updates: Mutex<VecDeque<Result<i64, store::Error>>>,
        fetches: Mutex<VecDeque<Result<Fetched, store::Error>>>,
        update_results: Mutex<VecDeque<Result<(), store::Error>>>,
        updates: Mutex<Vec<FxHashMap<String, f64>>>,
    }

    fn unavailable() -> store::Error {
        store::Error::Command {
            command: "fetch",
            stderr: "no such file".to_string(),
        }
    }

    #[async_trait]
    impl Series for Arc<FakeSeries> {
        async fn data_sources(&self) -> Result<Vec<String>, store::Error> {
            Ok(self.sources.clone())
        }

        async fn last_update(&self) -> Result<i64, store::Error> {
            Ok(self.last_update)
        }

        async fn next_update(&self) -> Result<i64, store::Error> {
            // Once the scripted wake times run out, park the loop far in
            // the future so the test can signal shutdown.
            self.next_updates
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Utc::now().timestamp() + 3_600))
        }

        async fn fetch(&self, _start: i64, _end: i64) -> Result<Fetched, store::Error> {
            self.fetches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(Fetched {
                        names: self.sources.clone(),
                        rows: Vec::new(),
                    })
                })
        }

        async fn update(&self, values: &FxHashMap<String, f64>) -> Result<(), store::Error> {
            self.updates.lock().unwrap().push(values.clone());
            self.update_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }
    }

    fn schema() -> Schema {
        Schema {
            rate_field: "precip_rate".to_string(),
            total_field: "precip_acc".to_string(),
            data_sources: vec!["precip_rate".to_string(), "precip_acc".to_string()],
        }
    }

    fn gauge_with_ticks(count: u32) -> Arc<RainGauge> {
        let gauge = Arc::new(RainGauge::new(0));
        for i in 0..count {
            gauge.on_edge(i.wrapping_mul(1_000).wrapping_add(1));
        }
        gauge
    }

    /// A boundary whose most recent crossing is roughly a day old, so a
    /// fresh `last_update` never reads as stale.
    fn distant_boundary() -> ResetBoundary {
        let next_hour = (Utc::now().hour() + 1) % 24;
        ResetBoundary::new(next_hour, 0, 0, 0).unwrap()
    }

    fn station(
        store: Arc<FakeSeries>,
        gauge: Arc<RainGauge>,
        boundary: ResetBoundary,
    ) -> (Station<Arc<FakeSeries>>, pluvio_signal::Broadcaster) {
        let (watcher, broadcaster) = pluvio_signal::signal();
        let station = Station::new(
            store,
            gauge,
            Reconciler::new(1.5, 1e-4),
            boundary,
            schema(),
            watcher,
        );
        (station, broadcaster)
    }

    async fn wait_for_updates(store: &FakeSeries, count: usize) {
        for _ in 0..500 {
            if store.updates.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("station never persisted {count} cycles");
    }

    #[tokio::test]
    async fn schema_mismatch_aborts_startup() {
        let store = Arc::new(FakeSeries {
            sources: vec!["outside_temp".to_string()],
            ..FakeSeries::default()
        });
        let (station, _broadcaster) = station(
            Arc::clone(&store),
            gauge_with_ticks(0),
            ResetBoundary::default(),
        );
        let result = station.spin().await;
        assert!(matches!(result, Err(Error::SchemaMismatch { .. })));
        assert!(store.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn next_update_failure_is_fatal() {
        let store = Arc::new(FakeSeries {
            sources: vec!["precip_rate".to_string(), "precip_acc".to_string()],
            next_updates: Mutex::new(VecDeque::from([Err(unavailable())])),
            ..FakeSeries::default()
        });
        let (station, _broadcaster) = station(
            Arc::clone(&store),
            gauge_with_ticks(0),
            ResetBoundary::default(),
        );
        assert!(matches!(station.spin().await, Err(Error::Store(_))));
    }

    // Four ticks at 1.5mm against a validated stored total of 4.5mm.
    #[tokio::test]
    async fn cycle_extends_validated_total() {
        let now = Utc::now().timestamp();
        let history = Fetched {
            names: vec!["precip_rate".to_string(), "precip_acc".to_string()],
            rows: vec![
                Row {
                    timestamp: now - 900,
                    values: vec![Some(1.5), Some(1.5)],
                },
                Row {
                    timestamp: now - 600,
                    values: vec![Some(3.0), Some(4.5)],
                },
                Row {
                    timestamp: now - 300,
                    values: vec![None, None],
                },
            ],
        };
        let store = Arc::new(FakeSeries {
            sources: vec!["precip_rate".to_string(), "precip_acc".to_string()],
            last_update: now - 60,
            next_updates: Mutex::new(VecDeque::from([Ok(now - 1)])),
            fetches: Mutex::new(VecDeque::from([Ok(history)])),
            ..FakeSeries::default()
        });
        let (station, broadcaster) =
            station(Arc::clone(&store), gauge_with_ticks(4), distant_boundary());
        let handle = tokio::spawn(station.spin());

        wait_for_updates(&store, 1).await;
        broadcaster.signal().unwrap();
        handle.await.unwrap().unwrap();

        let updates = store.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert!((updates[0]["precip_rate"] - 6.0).abs() < f64::EPSILON);
        assert!((updates[0]["precip_acc"] - 10.5).abs() < f64::EPSILON);
    }

    // A stale last entry forces the zero base: the written total is the
    // current rate alone, no matter what the store holds.
    #[tokio::test]
    async fn boundary_crossing_restarts_accumulation() {
        let now = Utc::now().timestamp();
        let store = Arc::new(FakeSeries {
            sources: vec!["precip_rate".to_string(), "precip_acc".to_string()],
            last_update: now - 86_400,
            next_updates: Mutex::new(VecDeque::from([Ok(now - 1)])),
            ..FakeSeries::default()
        });
        let boundary = ResetBoundary::new(Utc::now().hour(), 0, 0, 0).unwrap();
        let (station, broadcaster) =
            station(Arc::clone(&store), gauge_with_ticks(2), boundary);
        let handle = tokio::spawn(station.spin());

        wait_for_updates(&store, 1).await;
        broadcaster.signal().unwrap();
        handle.await.unwrap().unwrap();

        let updates = store.updates.lock().unwrap();
        assert!((updates[0]["precip_acc"] - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn fetch_failure_omits_the_total() {
        let now = Utc::now().timestamp();
        let store = Arc::new(FakeSeries {
            sources: vec!["precip_rate".to_string(), "precip_acc".to_string()],
            last_update: now - 60,
            next_updates: Mutex::new(VecDeque::from([Ok(now - 1)])),
            fetches: Mutex::new(VecDeque::from([Err(unavailable())])),
            ..FakeSeries::default()
        });
        let (station, broadcaster) =
            station(Arc::clone(&store), gauge_with_ticks(1), distant_boundary());
        let handle = tokio::spawn(station.spin());

        wait_for_updates(&store, 1).await;
        broadcaster.signal().unwrap();
        handle.await.unwrap().unwrap();

        let updates = store.updates.lock().unwrap();
        assert!(updates[0].contains_key("precip_rate"));
        assert!(!updates[0].contains_key("precip_acc"));
    }

    // The scheduler wait is cancellable: a signal during the sleep ends the
    // loop without another cycle running.
    #[tokio::test]
    async fn shutdown_during_scheduler_wait_exits() {
        let store = Arc::new(FakeSeries {
            sources: vec!["precip_rate".to_string(), "precip_acc".to_string()],
            ..FakeSeries::default()
        });
        let (station, broadcaster) = station(
            Arc::clone(&store),
            gauge_with_ticks(0),
            ResetBoundary::default(),
        );
        let handle = tokio::spawn(station.spin());
        tokio::task::yield_now().await;

        broadcaster.signal().unwrap();
        handle.await.unwrap().unwrap();
        assert!(store.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_failure_does_not_stop_the_loop() {
        let now = Utc::now().timestamp();
        let store = Arc::new(FakeSeries {
            sources: vec!["precip_rate".to_string(), "precip_acc".to_string()],
            last_update: now - 60,
            next_updates: Mutex::new(VecDeque::from([Ok(now - 2), Ok(now - 1)])),
            update_results: Mutex::new(VecDeque::from([Err(store::Error::Command {
                command: "update",
                stderr: "illegal attempt to update".to_string(),
            })])),
            ..FakeSeries::default()
        });
        let (station, broadcaster) =
            station(Arc::clone(&store), gauge_with_ticks(0), distant_boundary());
        let handle = tokio::spawn(station.spin());

        wait_for_updates(&store, 2).await;
        broadcaster.signal().unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(store.updates.lock().unwrap().len(), 2);
    }
}
