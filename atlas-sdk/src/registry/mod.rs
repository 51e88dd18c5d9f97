//! Owns the meter map, the publish-path consolidators, the evaluator, and
//! the scheduler that drives the three recurring tasks (component H):
//! publish tick, stream tick, subscription refresh.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use atlas_core::{atlas_warn, AtlasError, Id, Measurement, Statistic};

use crate::clock::SharedClock;
use crate::consolidation::Consolidator;
use crate::evaluator::{EvalResult, Evaluator};
use crate::meters::{
    BatchUpdater, Counter, DistributionSummary, DistributionSummaryBatchUpdater, Gauge, MaxGauge, Meter, Timer,
    TimerBatchUpdater,
};
use crate::publish::{EvalMetric, EvalPayload, EvalPublisher, Publisher, PublishPayload};
use crate::rollup::RollupPolicy;
use crate::scheduler::{SchedulePolicy, Scheduler};
use crate::subscribe::SubscriptionManager;
use crate::tags::ValidTagCharacters;

/// Configuration table from spec §6. Every field has a default matching
/// that table, and (with the `serde` feature) the whole struct is
/// deserializable with `#[serde(default)]` semantics per field, so a config
/// source only has to supply the keys it wants to override.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegistryConfig {
    pub step_millis: i64,
    pub lwc_step_millis: i64,
    pub meter_ttl_millis: i64,
    pub uri: Option<String>,
    pub eval_uri: Option<String>,
    pub config_uri: Option<String>,
    pub config_refresh_frequency_millis: i64,
    /// How long a seen subscription survives with no refresh. The current
    /// subscription manager replaces its cached list wholesale on every
    /// non-304 refresh rather than merging by last-seen time, which already
    /// satisfies this field's intent more eagerly than a TTL would; kept
    /// here for config-source compatibility (see DESIGN.md).
    pub config_ttl_millis: i64,
    pub connect_timeout_millis: i64,
    pub read_timeout_millis: i64,
    pub batch_size: usize,
    pub num_threads: usize,
    pub common_tags: BTreeMap<Arc<str>, Arc<str>>,
    pub valid_tag_characters: String,
    pub enabled: bool,
    pub lwc_enabled: bool,
    pub auto_start: bool,
    /// A subscription whose frequency equals the publish step is accepted
    /// only when this is `true`.
    pub ignore_publish_step: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            step_millis: 60_000,
            lwc_step_millis: 60_000,
            meter_ttl_millis: 15 * 60 * 1_000,
            uri: None,
            eval_uri: None,
            config_uri: None,
            config_refresh_frequency_millis: 10_000,
            config_ttl_millis: 150_000,
            connect_timeout_millis: 1_000,
            read_timeout_millis: 10_000,
            batch_size: 10_000,
            num_threads: 2,
            common_tags: BTreeMap::new(),
            valid_tag_characters: "A-Za-z0-9._-".to_string(),
            enabled: true,
            lwc_enabled: true,
            auto_start: false,
            ignore_publish_step: false,
        }
    }
}

/// One entry of the meter map, dispatched down to the concrete instrument
/// it wraps. A `HashMap<Id, MeterSlot>` rather than `HashMap<Id, Box<dyn
/// Meter>>` so that typed getters (`counter`, `gauge`, ...) can hand back
/// the concrete `Arc<Counter>` etc. a caller needs to `add`/`record`/`set`
/// on, while `poll_meters` only ever needs the `Meter` capability.
enum MeterSlot {
    Counter(Arc<Counter>),
    DistributionSummary(Arc<DistributionSummary>),
    Timer(Arc<Timer>),
    Gauge(Arc<Gauge>),
    MaxGauge(Arc<MaxGauge>),
}

impl MeterSlot {
    fn as_meter(&self) -> &dyn Meter {
        match self {
            MeterSlot::Counter(m) => m.as_ref(),
            MeterSlot::DistributionSummary(m) => m.as_ref(),
            MeterSlot::Timer(m) => m.as_ref(),
            MeterSlot::Gauge(m) => m.as_ref(),
            MeterSlot::MaxGauge(m) => m.as_ref(),
        }
    }
}

impl fmt::Debug for MeterSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_meter().id().fmt(f)
    }
}

/// The registry orchestrator: owns every meter, consolidates the publish
/// path, drives the evaluator for the stream path, applies the rollup
/// policy, and hands batches to the publisher/eval-publisher over a
/// three-task scheduler.
pub struct AtlasRegistry {
    config: RegistryConfig,
    clock: SharedClock,
    meters: RwLock<HashMap<Id, MeterSlot>>,
    atlas_measurements: Mutex<HashMap<Id, Consolidator>>,
    evaluator: Evaluator,
    rollup_policy: RollupPolicy,
    valid_tag_characters: ValidTagCharacters,
    publisher: Option<Arc<dyn Publisher>>,
    eval_publisher: Option<Arc<dyn EvalPublisher>>,
    subscription_manager: Option<Arc<SubscriptionManager>>,
    scheduler: Mutex<Option<Scheduler>>,
    last_poll_timestamp: AtomicI64,
    last_flush_timestamp: AtomicI64,
}

impl fmt::Debug for AtlasRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtlasRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AtlasRegistry {
    /// A registry with no publisher, eval-publisher, or subscription
    /// manager wired in, meters can be recorded and polled, but nothing
    /// leaves the process. Useful for embedding-only or test use.
    pub fn new(config: RegistryConfig, clock: SharedClock) -> Arc<Self> {
        AtlasRegistry::with_collaborators(config, clock, None, None, None, RollupPolicy::no_op())
    }

    pub fn with_collaborators(
        config: RegistryConfig,
        clock: SharedClock,
        publisher: Option<Arc<dyn Publisher>>,
        eval_publisher: Option<Arc<dyn EvalPublisher>>,
        subscription_manager: Option<Arc<SubscriptionManager>>,
        rollup_policy: RollupPolicy,
    ) -> Arc<Self> {
        let valid_tag_characters = ValidTagCharacters::parse(&config.valid_tag_characters);
        let num_threads = config.num_threads.max(1);
        let evaluator = Evaluator::new(config.lwc_step_millis);
        Arc::new(AtlasRegistry {
            clock,
            meters: RwLock::new(HashMap::new()),
            atlas_measurements: Mutex::new(HashMap::new()),
            evaluator,
            rollup_policy,
            valid_tag_characters,
            publisher,
            eval_publisher,
            subscription_manager,
            scheduler: Mutex::new(Some(Scheduler::new(num_threads))),
            last_poll_timestamp: AtomicI64::new(0),
            last_flush_timestamp: AtomicI64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn get_or_create<T, C, E>(&self, id: Id, ctor: C, extract: E) -> Arc<T>
    where
        C: FnOnce() -> MeterSlot,
        E: Fn(&MeterSlot) -> Option<Arc<T>>,
    {
        {
            let meters = self.meters.read().expect("meters lock poisoned");
            if let Some(slot) = meters.get(&id) {
                if let Some(found) = extract(slot) {
                    return found;
                }
            }
        }
        let mut meters = self.meters.write().expect("meters lock poisoned");
        let slot = meters.entry(id).or_insert_with(ctor);
        extract(slot).expect("meter requested under an id already used by a different meter type")
    }

    pub fn counter(&self, id: Id) -> Arc<Counter> {
        let (clock, ttl, step) = (self.clock.clone(), self.config.meter_ttl_millis, self.config.lwc_step_millis);
        let ctor_id = id.clone();
        self.get_or_create(
            id,
            move || MeterSlot::Counter(Arc::new(Counter::new(ctor_id, clock, ttl, step))),
            |slot| match slot {
                MeterSlot::Counter(m) => Some(m.clone()),
                _ => None,
            },
        )
    }

    pub fn distribution_summary(&self, id: Id) -> Arc<DistributionSummary> {
        let (clock, ttl, step) = (self.clock.clone(), self.config.meter_ttl_millis, self.config.lwc_step_millis);
        let ctor_id = id.clone();
        self.get_or_create(
            id,
            move || MeterSlot::DistributionSummary(Arc::new(DistributionSummary::new(ctor_id, clock, ttl, step))),
            |slot| match slot {
                MeterSlot::DistributionSummary(m) => Some(m.clone()),
                _ => None,
            },
        )
    }

    pub fn timer(&self, id: Id) -> Arc<Timer> {
        let (clock, ttl, step) = (self.clock.clone(), self.config.meter_ttl_millis, self.config.lwc_step_millis);
        let ctor_id = id.clone();
        self.get_or_create(
            id,
            move || MeterSlot::Timer(Arc::new(Timer::new(ctor_id, clock, ttl, step))),
            |slot| match slot {
                MeterSlot::Timer(m) => Some(m.clone()),
                _ => None,
            },
        )
    }

    pub fn gauge(&self, id: Id) -> Arc<Gauge> {
        let (clock, ttl) = (self.clock.clone(), self.config.meter_ttl_millis);
        let ctor_id = id.clone();
        self.get_or_create(
            id,
            move || MeterSlot::Gauge(Arc::new(Gauge::new(ctor_id, clock, ttl))),
            |slot| match slot {
                MeterSlot::Gauge(m) => Some(m.clone()),
                _ => None,
            },
        )
    }

    pub fn max_gauge(&self, id: Id) -> Arc<MaxGauge> {
        let (clock, ttl, step) = (self.clock.clone(), self.config.meter_ttl_millis, self.config.lwc_step_millis);
        let ctor_id = id.clone();
        self.get_or_create(
            id,
            move || MeterSlot::MaxGauge(Arc::new(MaxGauge::new(ctor_id, clock, ttl, step))),
            |slot| match slot {
                MeterSlot::MaxGauge(m) => Some(m.clone()),
                _ => None,
            },
        )
    }

    pub fn batch_updater(&self, id: Id, threshold: u64) -> BatchUpdater {
        BatchUpdater::new(self.counter(id), threshold)
    }

    pub fn distribution_summary_batch_updater(&self, id: Id, threshold: u64) -> DistributionSummaryBatchUpdater {
        DistributionSummaryBatchUpdater::new(self.distribution_summary(id), threshold)
    }

    pub fn timer_batch_updater(&self, id: Id, threshold: u64) -> TimerBatchUpdater {
        TimerBatchUpdater::new(self.timer(id), threshold)
    }

    /// Drops every meter that has been idle past its TTL and has no open
    /// `BatchUpdater` references. Not itself scheduled as a recurring task
    /// (the design leaves the cadence to the embedder); call periodically
    /// alongside or independent of `start`.
    pub fn remove_expired_meters(&self, now: i64) {
        let mut meters = self.meters.write().expect("meters lock poisoned");
        meters.retain(|_, slot| !slot.as_meter().has_expired(now));
    }

    fn measurements_dropped_http_counter(&self) -> Arc<Counter> {
        self.counter(Id::new("measurementsDroppedHttp", []))
    }

    fn sent_counter(&self) -> Arc<Counter> {
        self.counter(Id::new("sent", []))
    }

    fn dropped_invalid_counter(&self) -> Arc<Counter> {
        self.counter(Id::new("dropped-invalid", []))
    }

    /// Feeds every meter's completed window into the publish-path
    /// consolidator map and the evaluator, guarded so a given `t` is only
    /// polled once.
    fn poll_meters(&self, t: i64) {
        if t <= self.last_poll_timestamp.load(Ordering::SeqCst) {
            return;
        }
        self.last_poll_timestamp.store(t, Ordering::SeqCst);

        let meters = self.meters.read().expect("meters lock poisoned");
        for slot in meters.values() {
            slot.as_meter().measure(t, &mut |m: Measurement| {
                self.fold_into_publish_consolidator(&m);
                self.evaluator.update(&m.id, m.timestamp, m.value);
            });
        }
    }

    fn fold_into_publish_consolidator(&self, m: &Measurement) {
        let statistic = m.id.get("statistic").and_then(Statistic::parse).unwrap_or(Statistic::Gauge);
        let multiple = (self.config.step_millis / self.config.lwc_step_millis).max(1);
        let mut measurements = self.atlas_measurements.lock().expect("atlas measurements lock poisoned");
        let consolidator = measurements
            .entry(m.id.clone())
            .or_insert_with(|| Consolidator::for_statistic(statistic, self.config.lwc_step_millis, multiple));
        consolidator.update(m.timestamp, m.value);
    }

    /// Force-polls every publish-path consolidator, drops the ones that go
    /// empty, and runs the survivors through the rollup policy.
    fn get_batches(&self, t: i64) -> Vec<crate::rollup::RollupResult> {
        let live = {
            let mut measurements = self.atlas_measurements.lock().expect("atlas measurements lock poisoned");
            let mut live = Vec::new();
            measurements.retain(|id, c| {
                c.update(t, f64::NAN);
                let v = c.value(t);
                if v.is_finite() {
                    live.push(Measurement::new(id.clone(), t, v));
                }
                !c.is_empty()
            });
            live
        };
        self.rollup_policy.apply(&self.config.common_tags, live)
    }

    fn publish_payloads(&self, t: i64) -> Vec<PublishPayload> {
        let batch_size = self.config.batch_size.max(1);
        self.get_batches(t)
            .into_iter()
            .flat_map(|result| {
                let tags = result.common_tags;
                result
                    .measurements
                    .chunks(batch_size)
                    .map(|chunk| PublishPayload {
                        tags: tags.clone(),
                        metrics: chunk.iter().map(PublishPayload::metric_from_measurement).collect(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn publish_now(&self, t: i64) {
        self.poll_meters(t);
        let payloads = self.publish_payloads(t);
        if payloads.is_empty() {
            return;
        }
        let Some(publisher) = self.publisher.clone() else { return };

        let outcomes = futures_executor::block_on(futures_util::future::join_all(payloads.into_iter().map(
            |payload| {
                let publisher = publisher.clone();
                let batch_size = payload.metrics.len() as u64;
                async move { (batch_size, publisher.publish(payload).await) }
            },
        )));

        for (batch_size, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    if result.sent > 0 {
                        self.sent_counter().add(result.sent as f64);
                    }
                    if result.dropped_invalid > 0 {
                        self.dropped_invalid_counter().add(result.dropped_invalid as f64);
                    }
                }
                Err(e) => {
                    atlas_warn!(name: "publish_failed", error = e.to_string());
                    if batch_size > 0 {
                        self.measurements_dropped_http_counter().add(batch_size as f64);
                    }
                }
            }
        }
    }

    fn eval_payloads(&self, results: Vec<EvalResult>) -> Vec<EvalPayload> {
        let timestamp = results.first().map(|r| r.timestamp).unwrap_or(0);
        let metrics: Vec<EvalMetric> = results
            .into_iter()
            .flat_map(|result| {
                let sub_id = result.subscription_id;
                result.measurements.into_iter().map(move |m| EvalMetric {
                    id: sub_id.clone(),
                    tags: m.id.entries().map(|(k, v)| (Arc::from(k), Arc::from(v))).collect(),
                    value: m.value,
                })
            })
            .collect();
        let batch_size = self.config.batch_size.max(1);
        metrics
            .chunks(batch_size)
            .map(|chunk| EvalPayload {
                timestamp,
                metrics: chunk.to_vec(),
            })
            .collect()
    }

    fn stream_now(&self, t: i64) {
        self.poll_meters(t);
        if !self.config.lwc_enabled {
            return;
        }
        let results = self.evaluator.eval(t, &self.config.common_tags, &self.valid_tag_characters);
        if results.is_empty() {
            return;
        }
        let Some(eval_publisher) = self.eval_publisher.clone() else { return };
        let payloads = self.eval_payloads(results);

        let outcomes = futures_executor::block_on(futures_util::future::join_all(payloads.into_iter().map(
            |payload| {
                let eval_publisher = eval_publisher.clone();
                async move { eval_publisher.publish_eval(payload).await }
            },
        )));
        for outcome in outcomes {
            if let Err(e) = outcome {
                atlas_warn!(name: "eval_publish_failed", error = e.to_string());
            }
        }
    }

    fn publish_tick(self: &Arc<Self>) -> Result<(), AtlasError> {
        if !self.config.enabled {
            return Ok(());
        }
        let t = last_completed_multiple_of(self.clock.now_millis(), self.config.step_millis);
        if t <= self.last_flush_timestamp.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.last_flush_timestamp.store(t, Ordering::SeqCst);
        self.publish_now(t);
        Ok(())
    }

    fn stream_tick(self: &Arc<Self>) -> Result<(), AtlasError> {
        let t = last_completed_multiple_of(self.clock.now_millis(), self.config.lwc_step_millis);
        self.stream_now(t);
        Ok(())
    }

    fn subscription_refresh_tick(self: &Arc<Self>) -> Result<(), AtlasError> {
        let Some(manager) = self.subscription_manager.clone() else { return Ok(()) };
        manager.refresh()?;
        let subscriptions = manager.subscriptions();
        self.evaluator.sync(&subscriptions, &self.config.common_tags);
        Ok(())
    }

    /// Starts the three recurring tasks: publish (fixed-rate-skip-if-long
    /// at `step`), stream (same policy at `lwcStep`), and subscription
    /// refresh (fixed-delay at `configRefreshFrequency`).
    pub fn start(self: &Arc<Self>) {
        let scheduler_guard = self.scheduler.lock().expect("scheduler lock poisoned");
        let Some(scheduler) = scheduler_guard.as_ref() else { return };

        let step = Duration::from_millis(self.config.step_millis.max(0) as u64);
        let registry = self.clone();
        scheduler.schedule(SchedulePolicy::FixedRateSkipIfLong { period: step }, step, false, move || {
            registry.publish_tick()
        });

        let lwc_step = Duration::from_millis(self.config.lwc_step_millis.max(0) as u64);
        let registry = self.clone();
        scheduler.schedule(SchedulePolicy::FixedRateSkipIfLong { period: lwc_step }, lwc_step, false, move || {
            registry.stream_tick()
        });

        if self.subscription_manager.is_some() {
            let refresh_period = Duration::from_millis(self.config.config_refresh_frequency_millis.max(0) as u64);
            let registry = self.clone();
            scheduler.schedule(SchedulePolicy::FixedDelay { period: refresh_period }, Duration::ZERO, false, move || {
                registry.subscription_refresh_tick()
            });
        }
    }

    /// Stops the scheduler, then flushes one last window: advances to the
    /// next LWC-step boundary and polls, then to the next publish-step
    /// boundary and sends the final batch. Since `Clock` exposes only
    /// `now_millis`, this computes the *next* boundary from the current
    /// reading and flushes as of that boundary without attempting to
    /// mutate the clock (see DESIGN.md).
    pub fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.lock().expect("scheduler lock poisoned").take() {
            scheduler.shutdown();
        }

        let now = self.clock.now_millis();
        let lwc_boundary = round_up_to_boundary(now, self.config.lwc_step_millis);
        self.poll_meters(lwc_boundary);
        let step_boundary = round_up_to_boundary(lwc_boundary, self.config.step_millis);
        self.publish_now(step_boundary);
    }
}

fn last_completed_multiple_of(now_millis: i64, step_millis: i64) -> i64 {
    if step_millis <= 0 {
        return now_millis;
    }
    (now_millis / step_millis) * step_millis
}

fn round_up_to_boundary(t: i64, step_millis: i64) -> i64 {
    if step_millis <= 0 {
        return t;
    }
    let rem = t.rem_euclid(step_millis);
    if rem == 0 {
        t
    } else {
        t - rem + step_millis
    }
}
