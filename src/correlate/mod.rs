//! Two-event correlation.
//!
//! A [`CorrelationClass`] owns one [`object::CorrelationObject`] per
//! declared (first, second) event pair and routes every sample to the
//! object that claims its type. Objects hold first events pending until
//! the second arrives, then hand the pair to their strategy.

pub mod object;
pub mod strategy;
pub mod window;

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::{debug, info};

use crate::aggregate::report::{Frame, Geometry};
use crate::session::{Analysis, AnalysisStats};
use crate::tracer::event::{EventTypeId, Sample};
use object::{CorrelationObject, ObjectId, ObjectOptions, ObjectStats};
use strategy::CorrelationStrategy;
use window::{Timeline, DEFAULT_TIMELINE_CAPACITY};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("pair ({first}, {second}) already uses strategy {existing}, cannot add {requested}")]
    DuplicatePair {
        first: EventTypeId,
        second: EventTypeId,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("event type {event} already belongs to correlation object {owner}")]
    ConflictingEventType { event: EventTypeId, owner: ObjectId },

    #[error("a pair needs two distinct event types, got {event} twice")]
    SameEventType { event: EventTypeId },

    #[error("unknown correlation strategy {name:?}")]
    UnknownStrategy { name: String },

    #[error("no correlation object with id {id}")]
    UnknownObject { id: ObjectId },
}

/// Registry of correlation objects.
///
/// Objects live in an arena indexed by slot. Dispatch goes through
/// `by_type`, reporting through `by_id` in declaration order. Retiring an
/// object unhooks it from dispatch at once; its slot is freed at the end of
/// the next sweep.
pub struct CorrelationClass {
    objects: Vec<Option<CorrelationObject>>,
    by_pair: BTreeMap<(EventTypeId, EventTypeId), usize>,
    by_type: HashMap<EventTypeId, usize>,
    by_id: BTreeMap<ObjectId, usize>,
    names: HashMap<EventTypeId, String>,
    next_id: u32,
    seq: u64,
    now_ns: u64,
    timeline: Option<Timeline>,
    timeline_capacity: usize,
    retired: ObjectStats,
}

impl CorrelationClass {
    pub fn new() -> Self {
        Self::with_timeline_capacity(DEFAULT_TIMELINE_CAPACITY)
    }

    /// `capacity` bounds the samples kept for event windows.
    pub fn with_timeline_capacity(capacity: usize) -> Self {
        Self {
            objects: Vec::new(),
            by_pair: BTreeMap::new(),
            by_type: HashMap::new(),
            by_id: BTreeMap::new(),
            names: HashMap::new(),
            next_id: 0,
            seq: 0,
            now_ns: 0,
            timeline: None,
            timeline_capacity: capacity,
            retired: ObjectStats::default(),
        }
    }

    /// Name used for an event type in reports.
    pub fn name_event(&mut self, event: EventTypeId, name: impl Into<String>) {
        self.names.insert(event, name.into());
    }

    fn event_name(&self, event: EventTypeId) -> String {
        self.names
            .get(&event)
            .cloned()
            .unwrap_or_else(|| event.to_string())
    }

    /// Register a pair. Declaring the same pair with the same strategy
    /// again returns the existing object.
    pub fn declare_pair(
        &mut self,
        first: EventTypeId,
        second: EventTypeId,
        strategy: Box<dyn CorrelationStrategy>,
        options: ObjectOptions,
    ) -> Result<ObjectId, CorrelationError> {
        if first == second {
            return Err(CorrelationError::SameEventType { event: first });
        }

        if let Some(obj) = self.by_pair.get(&(first, second)).and_then(|&slot| self.live(slot)) {
            if obj.strategy_name() == strategy.name() {
                return Ok(obj.id());
            }
            return Err(CorrelationError::DuplicatePair {
                first,
                second,
                existing: obj.strategy_name(),
                requested: strategy.name(),
            });
        }

        for event in [first, second] {
            if let Some(owner) = self.by_type.get(&event).and_then(|&slot| self.live(slot)) {
                return Err(CorrelationError::ConflictingEventType {
                    event,
                    owner: owner.id(),
                });
            }
        }

        let id = ObjectId(self.next_id);
        self.next_id += 1;
        let names = (self.event_name(first), self.event_name(second));
        let object = CorrelationObject::new(id, (first, second), names, strategy, options);

        if object.needs_window() && self.timeline.is_none() {
            self.timeline = Some(Timeline::new(self.timeline_capacity));
        }
        info!(
            id = id.0,
            strategy = object.strategy_name(),
            first = %first,
            second = %second,
            "Declared correlation pair"
        );

        let slot = self.objects.len();
        self.objects.push(Some(object));
        self.by_pair.insert((first, second), slot);
        self.by_type.insert(first, slot);
        self.by_type.insert(second, slot);
        self.by_id.insert(id, slot);
        Ok(id)
    }

    fn live(&self, slot: usize) -> Option<&CorrelationObject> {
        self.objects
            .get(slot)
            .and_then(Option::as_ref)
            .filter(|o| !o.is_deleting())
    }

    /// Look up an object, including one retired but not yet freed.
    pub fn object(&self, id: ObjectId) -> Option<&CorrelationObject> {
        let slot = *self.by_id.get(&id)?;
        self.objects.get(slot).and_then(Option::as_ref)
    }

    /// Object owning an event type.
    pub fn lookup(&self, event: EventTypeId) -> Option<&CorrelationObject> {
        self.by_type.get(&event).and_then(|&slot| self.live(slot))
    }

    /// Live objects in declaration order.
    pub fn objects(&self) -> impl Iterator<Item = &CorrelationObject> {
        self.by_id.values().filter_map(|&slot| self.live(slot))
    }

    /// Route a sample to the object that claims its type. Returns whether
    /// any object did.
    pub fn dispatch(&mut self, sample: &Sample) -> bool {
        self.now_ns = self.now_ns.max(sample.time_ns());
        let seq = self.seq;
        self.seq += 1;
        if let Some(timeline) = self.timeline.as_mut() {
            timeline.push(seq, sample);
        }

        let Some(&slot) = self.by_type.get(&sample.event_type()) else {
            return false;
        };
        let Some(object) = self.objects.get_mut(slot).and_then(Option::as_mut) else {
            return false;
        };
        if object.is_deleting() {
            return false;
        }
        object.ingest(sample, seq, self.timeline.as_ref());
        true
    }

    /// Latest sample time seen.
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    /// Unhook an object from dispatch. Its storage is released by the next
    /// sweep.
    pub fn retire(&mut self, id: ObjectId) -> Result<(), CorrelationError> {
        let slot = *self
            .by_id
            .get(&id)
            .ok_or(CorrelationError::UnknownObject { id })?;
        let Some(object) = self.objects.get_mut(slot).and_then(Option::as_mut) else {
            return Err(CorrelationError::UnknownObject { id });
        };
        if object.is_deleting() {
            return Ok(());
        }
        object.mark_deleting();
        let (first, second) = object.types();
        self.by_pair.remove(&(first, second));
        self.by_type.remove(&first);
        self.by_type.remove(&second);
        debug!(id = id.0, "Retired correlation object");
        Ok(())
    }

    /// Sweep every live object, then free retired ones and trim the
    /// timeline to what pending events can still reference.
    pub fn sweep_all(&mut self, now_ns: u64) -> usize {
        let mut removed = 0;
        let mut retired = Vec::new();
        for (&id, &slot) in &self.by_id {
            let Some(object) = self.objects.get_mut(slot).and_then(Option::as_mut) else {
                continue;
            };
            if object.is_deleting() {
                retired.push(id);
                continue;
            }
            removed += object.sweep(now_ns);
        }

        for id in retired {
            if let Some(slot) = self.by_id.remove(&id) {
                if let Some(object) = self.objects.get_mut(slot).and_then(Option::take) {
                    self.retired.merge(object.stats());
                }
            }
        }

        self.trim_timeline();
        removed
    }

    fn trim_timeline(&mut self) {
        let Some(timeline) = self.timeline.as_mut() else {
            return;
        };
        let oldest = self
            .by_id
            .values()
            .filter_map(|&slot| self.objects.get(slot).and_then(Option::as_ref))
            .filter(|o| o.needs_window())
            .filter_map(CorrelationObject::oldest_seq)
            .min();
        // Keep one sample before the oldest first event for context.
        let keep_from = oldest.unwrap_or(self.seq).saturating_sub(1);
        timeline.trim_before(keep_from);
    }

    pub fn timeline_len(&self) -> usize {
        self.timeline.as_ref().map_or(0, Timeline::len)
    }

    /// Pending events across live objects.
    pub fn pending(&self) -> usize {
        self.objects().map(CorrelationObject::pending_len).sum()
    }

    /// Lifetime counters, including objects already freed.
    pub fn totals(&self) -> ObjectStats {
        let mut totals = self.retired;
        for slot in self.by_id.values() {
            if let Some(object) = self.objects.get(*slot).and_then(Option::as_ref) {
                totals.merge(object.stats());
            }
        }
        totals
    }

    /// Print every live object in declaration order.
    pub fn print(&mut self, frame: &mut Frame) {
        for &slot in self.by_id.values() {
            if let Some(object) = self.objects.get_mut(slot).and_then(Option::as_mut) {
                if !object.is_deleting() {
                    object.report(frame);
                }
            }
        }
    }
}

impl Default for CorrelationClass {
    fn default() -> Self {
        Self::new()
    }
}

impl Analysis for CorrelationClass {
    fn name(&self) -> &'static str {
        "correlate"
    }

    fn ingest(&mut self, sample: &Sample) {
        self.dispatch(sample);
    }

    fn report(&mut self, now_ns: u64, _geometry: &Geometry, frame: &mut Frame) {
        let now = now_ns.max(self.now_ns);
        self.sweep_all(now);
        self.print(frame);
    }

    fn stats(&self) -> AnalysisStats {
        let totals = self.totals();
        AnalysisStats {
            entries: self.pending(),
            matched: totals.matched,
            unmatched: totals.unmatched,
            expired: totals.expired,
            evicted: totals.evicted,
        }
    }
}
