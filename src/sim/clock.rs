//! Simulated time.
//!
//! Time is measured in cycles of the [`MainClock`].
//! Anything that happens at a point in time is an [`Event`] on the clock's [`DeltaQueue`].
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use avr_sim::sim::Simulator;
//!
//! let fired_at = Arc::new(AtomicU64::new(0));
//! let mut sim = Simulator::default();
//!
//! let f = Arc::clone(&fired_at);
//! sim.clock.insert_event(Arc::new(move |sim: &mut Simulator| {
//!     f.store(sim.cycles(), Ordering::Relaxed);
//! }), 10);
//!
//! sim.advance_cycles(5);
//! assert_eq!(fired_at.load(Ordering::Relaxed), 0);
//! sim.advance_cycles(5);
//! assert_eq!(fired_at.load(Ordering::Relaxed), 10);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use super::probe::same_ref;
use super::Simulator;

/// Something which happens at a scheduled point in simulated time.
///
/// Closures of type `Fn(&mut Simulator)` are events.
pub trait Event: Send + Sync {
    /// Fires the event.
    fn fire(&self, sim: &mut Simulator);
}
impl<F: Fn(&mut Simulator) + Send + Sync> Event for F {
    fn fire(&self, sim: &mut Simulator) {
        self(sim)
    }
}
/// A shared [`Event`] handle.
pub type EventRef = Arc<dyn Event>;

struct Link<E> {
    /// Cycles between the previous link (or the delivered time) and this link.
    delta: u64,
    /// Events due at this link, in insertion order.
    events: Vec<E>
}

/// A queue of events ordered by fire time.
///
/// Each entry stores its time relative to the entry before it,
/// so advancing time only touches the head of the queue.
///
/// Time moves in two steps:
/// 1. [`DeltaQueue::advance`] banks the cycles to be delivered.
/// 2. [`DeltaQueue::pop_due`] hands out every batch of events whose time falls within the banked cycles,
///    earliest first. The count moves to each batch's fire time as it is handed out,
///    and to the end of the window once nothing else is due.
///
/// Events added between those two steps are timed from the batch being delivered,
/// so an event scheduled by a firing event is ordered correctly against the rest of the queue.
///
/// Events scheduled for the same cycle are delivered in insertion order.
pub struct DeltaQueue<E> {
    links: VecDeque<Link<E>>,
    count: u64,
    budget: u64,
}
impl<E> DeltaQueue<E> {
    /// Creates an empty queue at time 0.
    pub fn new() -> Self {
        Self { links: VecDeque::new(), count: 0, budget: 0 }
    }

    /// The number of cycles delivered so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether the queue has no events.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Schedules `event` to fire `cycles` cycles from now.
    pub fn add(&mut self, event: E, cycles: u64) {
        let mut remaining = cycles;
        let mut i = 0;
        while let Some(link) = self.links.get_mut(i) {
            if remaining < link.delta {
                link.delta -= remaining;
                self.links.insert(i, Link { delta: remaining, events: vec![event] });
                return;
            }
            if remaining == link.delta {
                link.events.push(event);
                return;
            }
            remaining -= link.delta;
            i += 1;
        }
        self.links.push_back(Link { delta: remaining, events: vec![event] });
    }

    /// Removes every event matching the predicate, returning how many were removed.
    pub fn remove_where(&mut self, mut pred: impl FnMut(&E) -> bool) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while let Some(link) = self.links.get_mut(i) {
            let before = link.events.len();
            link.events.retain(|e| !pred(e));
            removed += before - link.events.len();

            if link.events.is_empty() {
                // fold the emptied link's delta into its successor
                let delta = link.delta;
                self.links.remove(i);
                if let Some(next) = self.links.get_mut(i) {
                    next.delta += delta;
                }
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Advances time by `cycles`.
    ///
    /// Events that become due are handed out by [`DeltaQueue::pop_due`].
    pub fn advance(&mut self, cycles: u64) {
        self.budget += cycles;
    }

    /// Takes the earliest batch of events which is due, if any.
    ///
    /// While a batch is handed out, [`DeltaQueue::count`] is that batch's fire time.
    pub fn pop_due(&mut self) -> Option<Vec<E>> {
        let Some(head) = self.links.front_mut() else {
            self.count += std::mem::take(&mut self.budget);
            return None;
        };

        if head.delta <= self.budget {
            self.budget -= head.delta;
            self.count += head.delta;
            self.links.pop_front().map(|l| l.events)
        } else {
            head.delta -= self.budget;
            self.count += std::mem::take(&mut self.budget);
            None
        }
    }

    /// The number of cycles until the next event, if there is one.
    pub fn head_delta(&self) -> Option<u64> {
        self.links.front().map(|l| l.delta.saturating_sub(self.budget))
    }
}
impl<E> Default for DeltaQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}
impl<E> std::fmt::Debug for DeltaQueue<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaQueue")
            .field("count", &self.count)
            .field("deltas", &self.links.iter().map(|l| (l.delta, l.events.len())).collect::<Vec<_>>())
            .finish()
    }
}

/// The clock driving a simulator.
///
/// The clock's events are fired by the [`Simulator`] that owns it
/// (see [`Simulator::advance_cycles`]).
#[derive(Debug)]
pub struct MainClock {
    hz: u64,
    queue: DeltaQueue<EventRef>
}
impl MainClock {
    /// Creates a new clock running at the given frequency.
    pub fn new(hz: u64) -> Self {
        Self { hz, queue: DeltaQueue::new() }
    }

    /// The frequency of this clock in hertz.
    pub fn hz(&self) -> u64 {
        self.hz
    }

    /// The number of cycles elapsed.
    pub fn count(&self) -> u64 {
        self.queue.count()
    }

    /// Schedules an event `cycles` cycles from now.
    pub fn insert_event(&mut self, event: EventRef, cycles: u64) {
        log::trace!("event scheduled at +{cycles} (cycle {})", self.count() + cycles);
        self.queue.add(event, cycles);
    }

    /// Removes every scheduling of the event, comparing by reference identity.
    ///
    /// This returns whether the event was scheduled.
    pub fn remove_event(&mut self, event: &EventRef) -> bool {
        let removed = self.queue.remove_where(|e| same_ref(e, event));
        if removed > 0 { log::trace!("{removed} scheduled event(s) removed"); }
        removed > 0
    }

    /// The number of cycles until the next scheduled event, if any.
    pub fn first_event_delta(&self) -> Option<u64> {
        self.queue.head_delta()
    }

    pub(super) fn queue_mut(&mut self) -> &mut DeltaQueue<EventRef> {
        &mut self.queue
    }

    /// Converts milliseconds to a number of cycles of this clock, truncating.
    pub fn millis_to_cycles(&self, ms: f64) -> u64 {
        (ms * self.hz as f64 / 1000.0) as u64
    }

    /// Converts a number of cycles of this clock to milliseconds.
    pub fn cycles_to_millis(&self, cycles: u64) -> f64 {
        1000.0 * cycles as f64 / self.hz as f64
    }
}

/// A clock derived from a driving [`MainClock`] by an integer divider.
///
/// A prescaled clock ticks once every `divider` driver cycles.
/// Tick boundaries are aligned to the driver count at which the prescaler was created or last [reset].
///
/// Events are scheduled on the driver, translated to the driver cycle on which the
/// requested prescaled tick lands.
///
/// [reset]: ClockPrescaler::reset
#[derive(Debug, Clone)]
pub struct ClockPrescaler {
    divider: u64,
    base: u64,
    ticks_before_base: u64
}
impl ClockPrescaler {
    /// Creates a prescaler over the given clock.
    ///
    /// A divider of 0 is treated as 1.
    pub fn new(driver: &MainClock, divider: u64) -> Self {
        Self {
            divider: divider.max(1),
            base: driver.count(),
            ticks_before_base: 0
        }
    }

    /// The divider of this prescaler.
    pub fn divider(&self) -> u64 {
        self.divider
    }

    /// The frequency of this prescaled clock.
    pub fn hz(&self, driver: &MainClock) -> u64 {
        driver.hz() / self.divider
    }

    fn driver_count(&self, driver: &MainClock) -> u64 {
        driver.count().saturating_sub(self.base)
    }

    /// The number of prescaled ticks elapsed.
    pub fn count(&self, driver: &MainClock) -> u64 {
        self.ticks_before_base + self.driver_count(driver) / self.divider
    }

    /// Schedules an event `delta` prescaled ticks from now.
    ///
    /// The event fires on the driver cycle on which that tick lands.
    /// A delta of 0 refers to the current tick, which has already passed,
    /// so the event fires at the next delivery.
    pub fn insert_event(&self, driver: &mut MainClock, event: EventRef, delta: u64) {
        let driver_count = self.driver_count(driver);
        let boundary = (driver_count / self.divider + delta) * self.divider;
        driver.insert_event(event, boundary.saturating_sub(driver_count));
    }

    /// Removes the event from the driving clock.
    pub fn remove_event(&self, driver: &mut MainClock, event: &EventRef) -> bool {
        driver.remove_event(event)
    }

    /// Re-aligns the prescaler's tick boundaries to the current driver cycle.
    ///
    /// The tick count is preserved and the frequency is unchanged.
    pub fn reset(&mut self, driver: &MainClock) {
        self.ticks_before_base = self.count(driver);
        self.base = driver.count();
    }
}

/// An event which reschedules itself every `period` cycles before firing the event it wraps.
///
/// These are created with [`Simulator::insert_periodic_event`].
/// Removing the handle returned by that function from the clock stops the period.
pub struct PeriodicEvent {
    event: EventRef,
    period: u64,
    me: Weak<PeriodicEvent>
}
impl PeriodicEvent {
    /// Creates a new periodic event.
    ///
    /// A period of 0 is treated as 1.
    pub fn new(event: EventRef, period: u64) -> Arc<Self> {
        Arc::new_cyclic(|me| Self { event, period: period.max(1), me: me.clone() })
    }

    /// The period of this event in cycles.
    pub fn period(&self) -> u64 {
        self.period
    }
}
impl Event for PeriodicEvent {
    fn fire(&self, sim: &mut Simulator) {
        if let Some(me) = self.me.upgrade() {
            sim.clock.insert_event(me, self.period);
        }
        self.event.fire(sim);
    }
}
