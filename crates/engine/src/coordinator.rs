//! Top-level control loop.
//!
//! One call to [`Coordinator::tick`] reads sensors, refreshes weather,
//! updates deficits, enforces the enable flag and schedule window, plans the
//! session and moves every zone's state machine forward. Only one zone holds
//! the watering slot at a time; the others soak or wait.

use std::mem::{discriminant, Discriminant};

use time::{Duration, OffsetDateTime};
use tracing::{debug, info, trace, warn};

use crate::absorption::AbsorptionLearner;
use crate::allocator::{Allocation, AllocationPlan, AllocationRequest, FairAllocator};
use crate::capability::{Actuator, Capabilities};
use crate::config::{EngineConfig, ZoneConfig};
use crate::cycle::{AbortReason, CycleTiming, Phase, Transition, ZoneCycle};
use crate::deficit::MoistureDeficitTracker;
use crate::duration::{DurationCalculator, DurationRequest};
use crate::error::EngineError;
use crate::persist::{EngineState, ZoneState, STATE_VERSION};
use crate::status::{EngineEvent, TickReport, ZoneStatus};
use crate::weather::{freeze_block, GateBlock, GateDecision, WeatherCache, WeatherSnapshot};

struct ZoneSlot {
    config: ZoneConfig,
    learner: AbsorptionLearner,
    cycle: ZoneCycle,
    /// Last known good reading.
    moisture: Option<f64>,
    temperature: Option<f64>,
    /// Consecutive ticks without a moisture reading.
    missed_reads: u32,
    request: DurationRequest,
    session_cycles: u32,
    cycles_total: u32,
    last_session: Option<OffsetDateTime>,
}

impl ZoneSlot {
    fn timing(&self, cfg: &EngineConfig) -> CycleTiming {
        CycleTiming {
            cycle_min: cfg.cycle_min,
            soak_min: cfg.soak_min,
            max_duration_min: self.config.max_duration_min,
            max_moisture: self.config.max_moisture,
        }
    }

    fn id(&self) -> &str {
        &self.config.zone_id
    }
}

struct Session {
    plan: AllocationPlan,
    /// A zone has started; the plan is frozen.
    executing: bool,
    completed: bool,
    zones_watered: usize,
}

pub struct Coordinator {
    config: EngineConfig,
    caps: Capabilities,
    zones: Vec<ZoneSlot>,
    tracker: MoistureDeficitTracker,
    weather: WeatherCache,
    calculator: DurationCalculator,
    allocator: FairAllocator,
    enabled: bool,
    session: Option<Session>,
    /// Holder of the single watering slot.
    active: Option<String>,
    last_tick: Option<OffsetDateTime>,
    /// Earliest start of the next session when the schedule is unbounded.
    next_session: Option<OffsetDateTime>,
    gate: GateDecision,
    /// Kind of block last reported, so a closed gate is announced once.
    announced_block: Option<Discriminant<GateBlock>>,
}

/// Last known good moisture; a zone that never reported cannot be planned.
fn planning_moisture(slot: &ZoneSlot) -> Result<f64, EngineError> {
    slot.moisture.ok_or_else(|| EngineError::SensorUnavailable {
        zone_id: slot.config.zone_id.clone(),
    })
}

/// Sends one valve command, retrying up to `attempts` times.
fn actuate(actuator: &mut dyn Actuator, attempts: u32, zone_id: &str, on: bool) -> Result<(), EngineError> {
    let mut reason = String::new();
    for attempt in 1..=attempts {
        match actuator.set(zone_id, on) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(zone = %zone_id, on, attempt, error = %e, "valve command failed");
                reason = e.message;
            }
        }
    }
    Err(EngineError::ActuationFailed {
        zone_id: zone_id.to_string(),
        attempts,
        reason,
    })
}

fn actuation_event(err: EngineError, on: bool) -> Option<EngineEvent> {
    match err {
        EngineError::ActuationFailed {
            zone_id,
            attempts,
            reason,
        } => Some(EngineEvent::ActuationFailed {
            zone_id,
            on,
            attempts,
            reason,
        }),
        _ => None,
    }
}

impl Coordinator {
    pub fn new(config: EngineConfig, caps: Capabilities) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            calculator: DurationCalculator::new(config.cycle_min),
            allocator: FairAllocator::new(config.cycle_min),
            config,
            caps,
            zones: Vec::new(),
            tracker: MoistureDeficitTracker::new(),
            weather: WeatherCache::new(),
            enabled: true,
            session: None,
            active: None,
            last_tick: None,
            next_session: None,
            gate: GateDecision::open(),
            announced_block: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn add_zone(&mut self, zone: ZoneConfig) -> Result<(), EngineError> {
        zone.validate()?;
        if self.zones.iter().any(|z| z.id() == zone.zone_id) {
            return Err(EngineError::DuplicateZone { zone_id: zone.zone_id });
        }
        info!(zone = %zone.zone_id, name = %zone.name, "zone added");
        self.zones.push(ZoneSlot {
            learner: AbsorptionLearner::new(
                self.config.default_absorption_rate,
                self.config.absorption_alpha,
                self.config.absorption_delay_min,
            ),
            config: zone,
            cycle: ZoneCycle::new(),
            moisture: None,
            temperature: None,
            missed_reads: 0,
            request: DurationRequest::none(),
            session_cycles: 0,
            cycles_total: 0,
            last_session: None,
        });
        Ok(())
    }

    /// Aborts the zone if it is running, switches it off and forgets it.
    pub fn remove_zone(&mut self, zone_id: &str, now: OffsetDateTime) -> Result<Vec<EngineEvent>, EngineError> {
        let idx = self.index_of(zone_id)?;
        let mut events = Vec::new();
        if self.zones[idx].cycle.is_active() {
            let tr = self.zones[idx].cycle.abort(now, AbortReason::Removed);
            self.apply(idx, tr, now, &mut events);
        }
        self.zones.remove(idx);
        self.tracker.remove(zone_id);
        if let Some(session) = self.session.as_mut() {
            session.plan.remove(zone_id);
        }
        if self.active.as_deref() == Some(zone_id) {
            self.active = None;
        }
        info!(zone = %zone_id, "zone removed");
        Ok(events)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Global switch. Disabling aborts running zones at once and ends the
    /// session.
    pub fn set_enabled(&mut self, enabled: bool, now: OffsetDateTime) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        if self.enabled == enabled {
            return events;
        }
        self.enabled = enabled;
        info!(enabled, "engine enable flag changed");
        if !enabled {
            self.shut_down(AbortReason::Disabled, now, &mut events);
        }
        events
    }

    /// Re-reads the weather provider now. A second call at the same instant
    /// returns the same snapshot and gate.
    pub fn refresh_forecast(&mut self, now: OffsetDateTime) -> Result<WeatherSnapshot, EngineError> {
        let snapshot = self
            .weather
            .refresh(self.caps.weather.as_deref(), self.config.forecast_hours, now)?;
        self.gate = self.weather.gate(&self.config);
        Ok(snapshot)
    }

    /// Forces a weather read and brings every zone's deficit and daily
    /// ledger up to `now` without planning or moving any zone.
    pub fn recalculate_deficits(&mut self, now: OffsetDateTime) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let rainfall = self.update_weather(now, true, &mut events);
        self.update_deficits(rainfall, now, &mut events);
        self.last_tick = Some(now);
        self.gate = self.weather.gate(&self.config);
        info!(zones = self.zones.len(), rainfall, "deficits recalculated");
        events
    }

    pub fn weather(&self) -> Option<&WeatherSnapshot> {
        self.weather.snapshot()
    }

    pub fn gate(&self) -> GateDecision {
        self.gate
    }

    /// Clears learned absorption, deficit history, counters and cached weather.
    pub fn reset_statistics(&mut self) {
        for slot in &mut self.zones {
            slot.learner.reset();
            slot.session_cycles = 0;
            slot.cycles_total = 0;
            slot.last_session = None;
        }
        self.next_session = None;
        self.tracker.reset();
        self.weather.clear();
        self.gate = GateDecision::open();
        info!("statistics reset");
    }

    pub fn zone_status(&self, zone_id: &str) -> Result<ZoneStatus, EngineError> {
        let idx = self.index_of(zone_id)?;
        Ok(self.status_of(&self.zones[idx]))
    }

    pub fn zone_statuses(&self) -> Vec<ZoneStatus> {
        self.zones.iter().map(|z| self.status_of(z)).collect()
    }

    pub fn plan(&self) -> Option<&AllocationPlan> {
        self.session.as_ref().map(|s| &s.plan)
    }

    pub fn watering_zone(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn export_state(&self) -> EngineState {
        EngineState {
            version: STATE_VERSION,
            zones: self
                .zones
                .iter()
                .map(|z| ZoneState {
                    zone_id: z.config.zone_id.clone(),
                    absorption: z.learner.model(),
                    deficit_mm: self.tracker.deficit(z.id()),
                    cycles_completed: z.session_cycles,
                    cycles_total: z.cycles_total,
                    last_session: z.last_session,
                })
                .collect(),
        }
    }

    /// Loads persisted per-zone state. Entries for unknown zones are skipped.
    pub fn restore_state(&mut self, state: &EngineState) -> Result<(), EngineError> {
        if state.version > STATE_VERSION {
            return Err(EngineError::InvalidConfig {
                reason: format!(
                    "persisted state version {} is newer than supported {}",
                    state.version, STATE_VERSION
                ),
            });
        }
        for zs in &state.zones {
            let Some(slot) = self.zones.iter_mut().find(|z| z.config.zone_id == zs.zone_id) else {
                warn!(zone = %zs.zone_id, "persisted state for unknown zone ignored");
                continue;
            };
            slot.learner = AbsorptionLearner::from_model(
                zs.absorption,
                self.config.default_absorption_rate,
                self.config.absorption_delay_min,
            );
            slot.session_cycles = zs.cycles_completed;
            slot.cycles_total = zs.cycles_total;
            slot.last_session = zs.last_session;
            self.tracker.restore(&zs.zone_id, zs.deficit_mm);
        }
        // Approximate: the cooldown runs from the latest zone start.
        let interval = self.session_interval();
        self.next_session = self
            .zones
            .iter()
            .filter_map(|z| z.last_session)
            .max()
            .map(|at| at + interval);
        debug!(zones = state.zones.len(), "engine state restored");
        Ok(())
    }

    /// Advances the control loop once.
    pub fn tick(&mut self, now: OffsetDateTime) -> TickReport {
        let mut events = Vec::new();

        self.read_sensors(now);
        let rainfall = self.update_weather(now, false, &mut events);
        self.update_deficits(rainfall, now, &mut events);
        self.last_tick = Some(now);

        let in_window = self.caps.schedule.is_within_window(now);
        if !self.enabled || !in_window {
            let reason = if self.enabled {
                AbortReason::ScheduleEnded
            } else {
                AbortReason::Disabled
            };
            self.shut_down(reason, now, &mut events);
            return self.report(events);
        }

        let gate = self.weather.gate(&self.config);
        let kind = gate.blocked.map(|b| discriminant(&b));
        if kind != self.announced_block {
            if let Some(block) = gate.blocked {
                info!(?block, "weather gate closed");
                events.push(EngineEvent::WeatherBlocked { block });
            } else {
                info!("weather gate open");
            }
            self.announced_block = kind;
        }
        self.gate = gate;

        self.escalate_sensor_faults(now, &mut events);
        self.advance_zones(now, &mut events);
        self.plan_session(now, &mut events);
        self.admit_next(now, &mut events);
        self.check_session_complete(now, &mut events);

        self.report(events)
    }

    fn report(&self, events: Vec<EngineEvent>) -> TickReport {
        TickReport {
            events,
            watering: self.active.clone(),
            gate_open: self.gate.is_open(),
        }
    }

    fn session_interval(&self) -> Duration {
        Duration::seconds_f64(self.config.session_interval_min * 60.0)
    }

    fn index_of(&self, zone_id: &str) -> Result<usize, EngineError> {
        self.zones
            .iter()
            .position(|z| z.id() == zone_id)
            .ok_or_else(|| EngineError::UnknownZone {
                zone_id: zone_id.to_string(),
            })
    }

    fn status_of(&self, z: &ZoneSlot) -> ZoneStatus {
        let alloc = z.cycle.allocation();
        let ledger = self.tracker.record(z.id());
        ZoneStatus {
            zone_id: z.config.zone_id.clone(),
            name: z.config.name.clone(),
            phase: z.cycle.phase(),
            cycles_completed: z.cycle.cycles_completed(),
            allocated_cycles: alloc.cycles,
            allocated_min: alloc.duration_min,
            requested_min: z.request.duration_min,
            watered_min: z.cycle.watered_min(),
            deficit_mm: self.tracker.deficit(z.id()),
            et_today_mm: ledger.map_or(0.0, |r| r.et_today_mm),
            rain_today_mm: ledger.map_or(0.0, |r| r.rain_today_mm),
            learned_rate: z.learner.rate(),
            rate_confidence: z.learner.confidence(),
            moisture: z.moisture,
            outcome: z.cycle.outcome(),
            cycles_total: z.cycles_total,
            last_session: z.last_session,
        }
    }

    /// Zone indices in plan order; zones outside the plan follow by id.
    fn plan_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.zones.len()).collect();
        let pos = |i: usize| {
            self.session
                .as_ref()
                .and_then(|s| s.plan.position(self.zones[i].id()))
                .unwrap_or(usize::MAX)
        };
        order.sort_by(|&a, &b| {
            pos(a)
                .cmp(&pos(b))
                .then_with(|| self.zones[a].id().cmp(self.zones[b].id()))
        });
        order
    }

    fn zone_gate_open(&self, slot: &ZoneSlot) -> bool {
        self.gate.is_open() && freeze_block(slot.temperature, self.config.freeze_threshold).is_none()
    }

    // ---- tick stages ----

    fn read_sensors(&mut self, now: OffsetDateTime) {
        for slot in &mut self.zones {
            let reading = self
                .caps
                .sensors
                .moisture(&slot.config.zone_id)
                .filter(|m| m.is_finite() && (0.0..=100.0).contains(m));
            match reading {
                Some(m) => {
                    slot.moisture = Some(m);
                    slot.missed_reads = 0;
                    slot.learner.record_sample(now, m);
                }
                None => {
                    slot.missed_reads = slot.missed_reads.saturating_add(1);
                    if slot.missed_reads == 1 {
                        debug!(zone = %slot.config.zone_id, fallback = ?slot.moisture, "moisture unavailable");
                    }
                }
            }
            if let Some(t) = self.caps.sensors.temperature(&slot.config.zone_id).filter(|t| t.is_finite()) {
                slot.temperature = Some(t);
            }
        }
    }

    /// Refreshes the forecast when due (or when `force` is set) and returns
    /// rain measured since the previous tick.
    fn update_weather(&mut self, now: OffsetDateTime, force: bool, events: &mut Vec<EngineEvent>) -> f64 {
        if force || self.weather.needs_refresh(now, self.config.forecast_refresh_min) {
            match self
                .weather
                .refresh(self.caps.weather.as_deref(), self.config.forecast_hours, now)
            {
                Ok(_) => {}
                Err(EngineError::ForecastUnavailable { reason }) if self.caps.weather.is_some() => {
                    warn!(%reason, "forecast unavailable, using cached weather");
                    events.push(EngineEvent::ForecastUnavailable { reason });
                }
                Err(e) => debug!(error = %e, "weather refresh skipped"),
            }
        }

        let (Some(rain), Some(since)) = (self.caps.rain.as_deref(), self.last_tick) else {
            return 0.0;
        };
        match rain.measured_since(since) {
            Ok(mm) if mm.is_finite() && mm > 0.0 => {
                self.weather.record_rain(mm);
                mm
            }
            Ok(_) => 0.0,
            Err(e) => {
                warn!(error = %e, "rain sensor read failed");
                0.0
            }
        }
    }

    fn update_deficits(&mut self, rainfall: f64, now: OffsetDateTime, events: &mut Vec<EngineEvent>) {
        for slot in &mut self.zones {
            self.tracker
                .update(&slot.config, self.weather.snapshot(), rainfall, now);
            if let Some(attr) = slot.learner.poll(now) {
                self.tracker.credit_irrigation(&slot.config.zone_id, attr.rise);
                if let Some(rate) = attr.rate {
                    let observations = slot.learner.model().observations;
                    info!(zone = %slot.config.zone_id, rate, observations, "absorption rate learned");
                    events.push(EngineEvent::RateLearned {
                        zone_id: slot.config.zone_id.clone(),
                        rate,
                        observations,
                    });
                }
            }
        }
    }

    fn escalate_sensor_faults(&mut self, now: OffsetDateTime, events: &mut Vec<EngineEvent>) {
        for idx in 0..self.zones.len() {
            let slot = &mut self.zones[idx];
            if slot.cycle.is_active() && slot.missed_reads >= self.config.sensor_fault_ticks {
                warn!(zone = %slot.config.zone_id, missed = slot.missed_reads, "moisture sensor fault");
                let tr = slot.cycle.abort(now, AbortReason::SensorFault);
                self.apply(idx, tr, now, events);
            }
        }
    }

    fn advance_zones(&mut self, now: OffsetDateTime, events: &mut Vec<EngineEvent>) {
        for idx in self.plan_order() {
            let timing = self.zones[idx].timing(&self.config);
            let slot = &mut self.zones[idx];
            if !slot.cycle.is_active() {
                continue;
            }
            let fresh = if slot.missed_reads == 0 { slot.moisture } else { None };
            let tr = slot.cycle.advance(now, fresh, &timing);
            self.apply(idx, tr, now, events);
        }
    }

    fn plan_session(&mut self, now: OffsetDateTime, events: &mut Vec<EngineEvent>) {
        if self.session.is_none() {
            if let Some(next) = self.next_session {
                if now < next && self.caps.schedule.remaining(now).is_none() {
                    return;
                }
            }
            for slot in &mut self.zones {
                slot.cycle.reset(Allocation::default());
            }
            self.session = Some(Session {
                plan: AllocationPlan::default(),
                executing: false,
                completed: false,
                zones_watered: 0,
            });
            info!("watering session started");
            events.push(EngineEvent::SessionStarted { at: now });
        }
        if self.session.as_ref().is_some_and(|s| s.executing || s.completed) {
            return;
        }

        let mut requests = Vec::new();
        for idx in 0..self.zones.len() {
            let gate_ok = self.zone_gate_open(&self.zones[idx]);
            let slot = &mut self.zones[idx];
            let deficit = self.tracker.deficit(slot.id());
            let moisture = match planning_moisture(slot) {
                Ok(m) => m,
                Err(e) => {
                    trace!(error = %e, "zone not requested");
                    slot.request = DurationRequest::none();
                    continue;
                }
            };
            slot.request = if moisture <= slot.config.min_moisture {
                self.calculator
                    .compute(&slot.config, &slot.learner, moisture, deficit, gate_ok)
            } else {
                DurationRequest::none()
            };
            if !slot.request.is_empty() {
                requests.push(AllocationRequest {
                    zone_id: slot.config.zone_id.clone(),
                    requested_min: slot.request.duration_min,
                    deficit: slot.config.max_moisture - moisture,
                });
            }
        }

        let budget = self
            .caps
            .schedule
            .remaining(now)
            .map(|d| d.as_seconds_f64() / 60.0);
        let plan = self.allocator.allocate(&requests, budget);
        for slot in &mut self.zones {
            let alloc = plan.get(slot.id()).copied().unwrap_or_default();
            if slot.cycle.allocation() != alloc {
                slot.cycle.reset(alloc);
            }
        }
        if let Some(session) = self.session.as_mut() {
            if session.plan != plan && !plan.is_empty() {
                debug!(zones = plan.len(), total_min = plan.total_min(), ?budget, "session plan updated");
            }
            session.plan = plan;
        }
    }

    fn admit_next(&mut self, now: OffsetDateTime, events: &mut Vec<EngineEvent>) {
        if self.active.is_some() || self.session.as_ref().map_or(true, |s| s.completed) {
            return;
        }
        for idx in self.plan_order() {
            let slot = &self.zones[idx];
            if !slot.cycle.wants_slot() {
                continue;
            }
            // The gate only holds back first starts; soak continuations go ahead.
            if slot.cycle.phase() == Phase::Idle && !self.zone_gate_open(slot) {
                continue;
            }

            let timing = slot.timing(&self.config);
            let zone_id = slot.config.zone_id.clone();
            let moisture = slot.moisture.unwrap_or(0.0);
            let first_start = slot.cycle.phase() == Phase::Idle;

            let tr = self.zones[idx].cycle.start_watering(now, moisture, &timing);
            if tr != Transition::StartedWatering {
                self.apply(idx, tr, now, events);
                continue;
            }
            // Freeze the plan even if the valve refuses: the failed zone must
            // not be re-planned and retried on the next tick.
            if let Some(session) = self.session.as_mut() {
                session.executing = true;
            }

            if let Err(e) = actuate(&mut *self.caps.actuator, self.config.actuation_attempts, &zone_id, true) {
                events.extend(actuation_event(e, true));
                // Aborting sends the off command for a half-opened valve.
                let tr = self.zones[idx].cycle.abort(now, AbortReason::ActuatorFailure);
                self.apply(idx, tr, now, events);
                continue;
            }

            let slot = &mut self.zones[idx];
            // A reading taken from here on includes this cycle's water.
            if slot.learner.has_pending() {
                debug!(zone = %zone_id, "next cycle started before the delayed reading, observation dropped");
                slot.learner.cancel_observation();
            }
            let alloc = slot.cycle.allocation();
            let minutes = (alloc.duration_min - slot.cycle.watered_min()).min(self.config.cycle_min);
            if first_start {
                slot.last_session = Some(now);
                if let Some(session) = self.session.as_mut() {
                    session.zones_watered += 1;
                }
            }
            info!(
                zone = %zone_id,
                cycle = slot.cycle.cycles_completed() + 1,
                of = alloc.cycles,
                minutes,
                "zone watering"
            );
            events.push(EngineEvent::ZoneStarted {
                zone_id: zone_id.clone(),
                cycle: slot.cycle.cycles_completed() + 1,
                cycles: alloc.cycles,
                minutes,
            });
            self.active = Some(zone_id);
            return;
        }
    }

    fn check_session_complete(&mut self, now: OffsetDateTime, events: &mut Vec<EngineEvent>) {
        let busy = self.zones.iter().any(|z| z.cycle.is_active() || z.cycle.wants_slot());
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.completed || !session.executing || busy {
            return;
        }
        session.completed = true;
        let zones_watered = session.zones_watered;
        info!(zones_watered, "watering session complete");
        events.push(EngineEvent::SessionEnded { at: now, zones_watered });
        if self.caps.schedule.remaining(now).is_none() {
            self.session = None;
            let next = now + self.session_interval();
            debug!(%next, "next session held back");
            self.next_session = Some(next);
        }
    }

    /// Aborts every running zone and closes the session.
    fn shut_down(&mut self, reason: AbortReason, now: OffsetDateTime, events: &mut Vec<EngineEvent>) {
        for idx in self.plan_order() {
            if self.zones[idx].cycle.is_active() {
                let tr = self.zones[idx].cycle.abort(now, reason);
                self.apply(idx, tr, now, events);
            }
        }
        self.active = None;
        if let Some(session) = self.session.take() {
            for slot in &mut self.zones {
                if slot.cycle.phase() == Phase::Idle {
                    slot.cycle.reset(Allocation::default());
                }
            }
            if !session.completed {
                info!(?reason, "watering session ended");
                events.push(EngineEvent::SessionEnded {
                    at: now,
                    zones_watered: session.zones_watered,
                });
            }
        }
    }

    /// Carries out the side effects of a state machine transition.
    fn apply(&mut self, idx: usize, tr: Transition, now: OffsetDateTime, events: &mut Vec<EngineEvent>) {
        let zone_id = self.zones[idx].config.zone_id.clone();
        let attempts = self.config.actuation_attempts;
        let mut switch_failed = None;
        if let Some(on) = tr.switch() {
            if let Err(e) = actuate(&mut *self.caps.actuator, attempts, &zone_id, on) {
                switch_failed = actuation_event(e, on);
            }
        }

        let slot = &mut self.zones[idx];
        if let Some(iv) = slot.cycle.take_interval() {
            slot.learner
                .begin_observation(iv.watered_min, iv.moisture_before, iv.ended_at);
        }
        let cycles_completed = slot.cycle.cycles_completed();
        let watered_min = slot.cycle.watered_min();
        match tr {
            Transition::StartedSoaking => {
                slot.cycles_total = slot.cycles_total.saturating_add(1);
                slot.session_cycles = cycles_completed;
                info!(zone = %zone_id, cycles_completed, "zone soaking");
                events.push(EngineEvent::ZoneSoaking {
                    zone_id: zone_id.clone(),
                    cycles_completed,
                    watered_min,
                });
            }
            Transition::SoakComplete => {
                debug!(zone = %zone_id, "soak complete, waiting for slot");
            }
            Transition::Done(reason) => {
                info!(zone = %zone_id, ?reason, cycles_completed, watered_min, "zone done");
                events.push(EngineEvent::ZoneDone {
                    zone_id: zone_id.clone(),
                    reason,
                    cycles_completed,
                    watered_min,
                });
            }
            Transition::Aborted(reason) => {
                warn!(zone = %zone_id, ?reason, cycles_completed, watered_min, "zone aborted");
                events.push(EngineEvent::ZoneAborted {
                    zone_id: zone_id.clone(),
                    reason,
                    cycles_completed,
                    watered_min,
                });
            }
            Transition::Stay | Transition::StartedWatering => {}
        }
        if matches!(
            tr,
            Transition::StartedSoaking | Transition::Done(_) | Transition::Aborted(_)
        ) && self.active.as_deref() == Some(zone_id.as_str())
        {
            self.active = None;
        }

        if let Some(ev) = switch_failed {
            events.push(ev);
            // The valve may still be open; take the zone out of the session.
            let slot = &mut self.zones[idx];
            if !slot.cycle.is_finished() {
                let tr = slot.cycle.abort(now, AbortReason::ActuatorFailure);
                let watered_min = slot.cycle.watered_min();
                let cycles_completed = slot.cycle.cycles_completed();
                if let Transition::Aborted(reason) = tr {
                    events.push(EngineEvent::ZoneAborted {
                        zone_id,
                        reason,
                        cycles_completed,
                        watered_min,
                    });
                }
            }
        }
    }
}
