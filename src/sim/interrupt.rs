//! The interrupt table.
//!
//! The [`InterruptTable`] tracks three bitmasks over the interrupt vectors:
//! - **posted**: the interrupt's request flag is set,
//! - **enabled**: the interrupt's mask bit is set,
//! - **pending**: posted and enabled, i.e., eligible for dispatch.
//!
//! When the global interrupt flag (`SREG.I`) is set and any interrupt is pending,
//! the [`Simulator`] dispatches the lowest-numbered pending interrupt before the next instruction.
//!
//! Devices change interrupt state through the [`Simulator`] methods
//! ([`Simulator::post_interrupt`], [`Simulator::set_posted`], etc.), which update the table
//! and then fire any [`InterruptProbe`]s registered for the interrupt.
//! The table's own mutators update state without firing probes.
//!
//! A device which wants to react to its interrupt being dispatched (e.g., to auto-clear a flag bit)
//! registers a [`Notification`].
//!
//! ```
//! use avr_sim::sim::Simulator;
//!
//! let mut sim = Simulator::default();
//! sim.post_interrupt(7).unwrap();
//! sim.post_interrupt(5).unwrap();
//! assert!(!sim.interrupts().is_pending(5));
//!
//! sim.enable_interrupt(5).unwrap();
//! sim.enable_interrupt(7).unwrap();
//! assert_eq!(sim.interrupts().highest_priority(), Some(5));
//! ```

use std::sync::Arc;

use super::probe::{remove_ref, InterruptProbe, InterruptProbeRef};
use super::{SimErr, Simulator};

/// A device-side hook for an interrupt vector.
#[allow(unused_variables)]
pub trait Notification: Send + Sync {
    /// Called when the interrupt is forced (see [`Simulator::force_interrupt`]).
    ///
    /// This should put the device into the state it would be in had it raised the interrupt naturally.
    fn force(&self, sim: &mut Simulator, inum: u8) {}

    /// Called when the interrupt's handler is dispatched.
    ///
    /// Non-sticky interrupts clear their request flag here.
    fn invoke(&self, sim: &mut Simulator, inum: u8) {}
}
/// A shared [`Notification`] handle.
pub type NotificationRef = Arc<dyn Notification>;

/// The posted, enabled, and pending state of every interrupt vector.
pub struct InterruptTable {
    len: u8,
    posted: u64,
    enabled: u64,
    pending: u64,
    stale: bool,
    probes: Box<[Vec<InterruptProbeRef>]>,
    global_probes: Vec<InterruptProbeRef>,
    notify: Box<[Option<NotificationRef>]>,
}

impl InterruptTable {
    /// The maximum number of interrupt vectors a table can hold.
    pub const MAX_INTERRUPTS: u8 = 64;

    /// Creates a table with `len` vectors.
    ///
    /// `len` is clamped to [`InterruptTable::MAX_INTERRUPTS`].
    pub fn new(len: u8) -> Self {
        let len = len.min(Self::MAX_INTERRUPTS);
        Self {
            len,
            posted: 0,
            enabled: 0,
            pending: 0,
            stale: false,
            probes: vec![vec![]; usize::from(len)].into_boxed_slice(),
            global_probes: vec![],
            notify: vec![None; usize::from(len)].into_boxed_slice(),
        }
    }

    /// The number of interrupt vectors.
    pub fn len(&self) -> u8 {
        self.len
    }
    /// Whether the table has no vectors.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn mask(&self, inum: u8) -> Result<u64, SimErr> {
        match inum < self.len {
            true  => Ok(1 << inum),
            false => Err(SimErr::InvalidInterrupt { inum, count: self.len }),
        }
    }

    fn update(&mut self) {
        self.pending = self.posted & self.enabled;
    }

    /// Sets the posted bit of the interrupt.
    pub fn post(&mut self, inum: u8) -> Result<(), SimErr> {
        self.posted |= self.mask(inum)?;
        self.update();
        self.stale = true;
        Ok(())
    }
    /// Clears the posted bit of the interrupt.
    pub fn unpost(&mut self, inum: u8) -> Result<(), SimErr> {
        self.posted &= !self.mask(inum)?;
        self.update();
        Ok(())
    }
    /// Sets the enabled bit of the interrupt.
    pub fn enable(&mut self, inum: u8) -> Result<(), SimErr> {
        self.enabled |= self.mask(inum)?;
        self.update();
        self.stale = true;
        Ok(())
    }
    /// Clears the enabled bit of the interrupt.
    pub fn disable(&mut self, inum: u8) -> Result<(), SimErr> {
        self.enabled &= !self.mask(inum)?;
        self.update();
        Ok(())
    }

    /// Whether the interrupt is posted.
    pub fn is_posted(&self, inum: u8) -> bool {
        self.mask(inum).is_ok_and(|m| self.posted & m != 0)
    }
    /// Whether the interrupt is enabled.
    pub fn is_enabled(&self, inum: u8) -> bool {
        self.mask(inum).is_ok_and(|m| self.enabled & m != 0)
    }
    /// Whether the interrupt is pending (posted and enabled).
    pub fn is_pending(&self, inum: u8) -> bool {
        self.mask(inum).is_ok_and(|m| self.pending & m != 0)
    }
    /// The posted bitmask.
    pub fn posted(&self) -> u64 {
        self.posted
    }
    /// The enabled bitmask.
    pub fn enabled(&self) -> u64 {
        self.enabled
    }
    /// The pending bitmask.
    pub fn pending(&self) -> u64 {
        self.pending
    }

    /// The pending interrupt to dispatch next.
    ///
    /// The lowest-numbered pending interrupt has the highest priority.
    pub fn highest_priority(&self) -> Option<u8> {
        match self.pending {
            0 => None,
            p => Some(p.trailing_zeros() as u8),
        }
    }

    /// Marks the table as changed so the run loop re-checks interrupts.
    pub(super) fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Consumes the changed mark, returning whether it was set.
    pub(super) fn take_stale(&mut self) -> bool {
        std::mem::take(&mut self.stale)
    }

    /// Clears all posted and enabled bits.
    pub(super) fn clear(&mut self) {
        self.posted = 0;
        self.enabled = 0;
        self.update();
    }

    /// Registers the device notification of the interrupt, replacing any existing one.
    pub fn register_notification(&mut self, inum: u8, notification: NotificationRef) -> Result<(), SimErr> {
        self.mask(inum)?;
        self.notify[usize::from(inum)] = Some(notification);
        Ok(())
    }
    /// Gets the device notification of the interrupt.
    pub fn notification(&self, inum: u8) -> Option<NotificationRef> {
        self.notify.get(usize::from(inum))?.clone()
    }

    /// Adds a probe for a single interrupt.
    pub fn insert_probe(&mut self, inum: u8, probe: InterruptProbeRef) -> Result<(), SimErr> {
        self.mask(inum)?;
        self.probes[usize::from(inum)].push(probe);
        Ok(())
    }
    /// Removes a probe for a single interrupt, comparing by reference identity.
    pub fn remove_probe(&mut self, inum: u8, probe: &InterruptProbeRef) -> bool {
        self.probes.get_mut(usize::from(inum))
            .is_some_and(|l| remove_ref(l, probe))
    }
    /// Adds a probe for every interrupt.
    pub fn insert_global_probe(&mut self, probe: InterruptProbeRef) {
        self.global_probes.push(probe);
    }
    /// Removes a probe for every interrupt, comparing by reference identity.
    pub fn remove_global_probe(&mut self, probe: &InterruptProbeRef) -> bool {
        remove_ref(&mut self.global_probes, probe)
    }

    /// A snapshot of the probes to fire for the interrupt: global probes first, then per-vector probes.
    fn probes_for(&self, inum: u8) -> Vec<InterruptProbeRef> {
        let local = self.probes.get(usize::from(inum)).map_or(&[][..], Vec::as_slice);
        if self.global_probes.is_empty() && local.is_empty() {
            return vec![];
        }
        self.global_probes.iter()
            .chain(local)
            .cloned()
            .collect()
    }
}
impl std::fmt::Debug for InterruptTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptTable")
            .field("len", &self.len)
            .field("posted", &format_args!("{:#x}", self.posted))
            .field("enabled", &format_args!("{:#x}", self.enabled))
            .field("pending", &format_args!("{:#x}", self.pending))
            .finish_non_exhaustive()
    }
}

type ProbeFn = fn(&dyn InterruptProbe, &mut Simulator, u8);

impl Simulator {
    fn fire_interrupt_probes(&mut self, inum: u8, f: ProbeFn) {
        for p in self.interrupts.probes_for(inum) {
            f(&*p, self, inum);
        }
    }
    fn fire_global_interrupt_probes(&mut self, f: ProbeFn) {
        if self.interrupts.global_probes.is_empty() { return; }

        for p in self.interrupts.global_probes.clone() {
            f(&*p, self, 0);
        }
    }

    /// Gets a reference to the interrupt table.
    pub fn interrupts(&self) -> &InterruptTable {
        &self.interrupts
    }
    /// Gets a mutable reference to the interrupt table.
    ///
    /// This is used to register probes and notifications.
    /// State changes made directly on the table do not fire probes.
    pub fn interrupts_mut(&mut self) -> &mut InterruptTable {
        &mut self.interrupts
    }

    /// Posts the interrupt and fires its probes.
    pub fn post_interrupt(&mut self, inum: u8) -> Result<(), SimErr> {
        self.interrupts.post(inum)?;
        self.fire_interrupt_probes(inum, |p, s, n| p.fire_when_posted(s, n));
        Ok(())
    }
    /// Unposts the interrupt and fires its probes.
    pub fn unpost_interrupt(&mut self, inum: u8) -> Result<(), SimErr> {
        self.interrupts.unpost(inum)?;
        self.fire_interrupt_probes(inum, |p, s, n| p.fire_when_unposted(s, n));
        Ok(())
    }
    /// Enables the interrupt and fires its probes.
    pub fn enable_interrupt(&mut self, inum: u8) -> Result<(), SimErr> {
        self.interrupts.enable(inum)?;
        self.fire_interrupt_probes(inum, |p, s, n| p.fire_when_enabled(s, n));
        Ok(())
    }
    /// Disables the interrupt and fires its probes.
    pub fn disable_interrupt(&mut self, inum: u8) -> Result<(), SimErr> {
        self.interrupts.disable(inum)?;
        self.fire_interrupt_probes(inum, |p, s, n| p.fire_when_disabled(s, n));
        Ok(())
    }

    /// Posts or unposts the interrupt.
    pub fn set_posted(&mut self, inum: u8, posted: bool) -> Result<(), SimErr> {
        match posted {
            true  => self.post_interrupt(inum),
            false => self.unpost_interrupt(inum),
        }
    }
    /// Enables or disables the interrupt.
    pub fn set_enabled(&mut self, inum: u8, enabled: bool) -> Result<(), SimErr> {
        match enabled {
            true  => self.enable_interrupt(inum),
            false => self.disable_interrupt(inum),
        }
    }

    /// Forces the interrupt.
    ///
    /// This posts the interrupt and then calls its [`Notification::force`],
    /// so the owning device's state reflects the interrupt having been raised.
    pub fn force_interrupt(&mut self, inum: u8) -> Result<(), SimErr> {
        self.post_interrupt(inum)?;
        if let Some(n) = self.interrupts.notification(inum) {
            n.force(self, inum);
        }
        Ok(())
    }

    /// Sets the global interrupt flag (`SREG.I`) and fires global interrupt probes with vector 0.
    pub fn enable_interrupts(&mut self) {
        self.sreg.set_i(true);
        self.interrupts.mark_stale();
        self.inner_loop = false;
        self.fire_global_interrupt_probes(|p, s, n| p.fire_when_enabled(s, n));
    }
    /// Clears the global interrupt flag (`SREG.I`) and fires global interrupt probes with vector 0.
    pub fn disable_interrupts(&mut self) {
        self.sreg.set_i(false);
        self.fire_global_interrupt_probes(|p, s, n| p.fire_when_disabled(s, n));
    }

    /// Fires the probes and notification that precede dispatching an interrupt handler.
    pub(super) fn before_invoke(&mut self, inum: u8) {
        self.fire_interrupt_probes(inum, |p, s, n| p.fire_before_invoke(s, n));
        if let Some(n) = self.interrupts.notification(inum) {
            n.invoke(self, inum);
        }
    }
    /// Fires the probes that follow dispatching an interrupt handler.
    pub(super) fn after_invoke(&mut self, inum: u8) {
        self.fire_interrupt_probes(inum, |p, s, n| p.fire_after_invoke(s, n));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::sim::probe::{InterruptProbe, InterruptProbeRef};
    use crate::sim::{SimErr, Simulator};

    use super::{InterruptTable, Notification};

    #[test]
    fn test_pending_invariant() {
        let mut table = InterruptTable::new(36);

        // a fixed pseudo-random walk over every operation
        let mut x: u32 = 0x1234_5678;
        for _ in 0..2000 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            let inum = (x % 36) as u8;
            match (x >> 8) % 4 {
                0 => table.post(inum).unwrap(),
                1 => table.unpost(inum).unwrap(),
                2 => table.enable(inum).unwrap(),
                _ => table.disable(inum).unwrap(),
            }

            assert_eq!(table.pending(), table.posted() & table.enabled());
            for n in 0..36 {
                assert_eq!(table.is_pending(n), table.is_posted(n) && table.is_enabled(n));
            }
        }
    }

    #[test]
    fn test_priority_lowest_bit() {
        let mut table = InterruptTable::new(36);
        for n in [7, 2, 5] {
            table.post(n).unwrap();
            table.enable(n).unwrap();
        }
        assert_eq!(table.highest_priority(), Some(2));

        // every single-bit and two-bit pattern
        for a in 0..36u8 {
            for b in a..36u8 {
                let mut t = InterruptTable::new(36);
                for n in [a, b] {
                    t.post(n).unwrap();
                    t.enable(n).unwrap();
                }
                assert_eq!(t.highest_priority(), Some(a));
            }
        }

        assert_eq!(InterruptTable::new(8).highest_priority(), None);
    }

    #[test]
    fn test_invalid_vector() {
        let mut table = InterruptTable::new(8);
        assert!(matches!(table.post(8), Err(SimErr::InvalidInterrupt { inum: 8, count: 8 })));
        assert!(!table.is_posted(8));
    }

    #[test]
    fn test_stale_on_post_and_enable() {
        let mut table = InterruptTable::new(8);
        assert!(!table.take_stale());
        table.unpost(1).unwrap();
        table.disable(1).unwrap();
        assert!(!table.take_stale());
        table.post(1).unwrap();
        assert!(table.take_stale());
        assert!(!table.take_stale());
        table.enable(1).unwrap();
        assert!(table.take_stale());
    }

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);
    impl Log {
        fn push(&self, s: String) {
            self.0.lock().unwrap().push(s);
        }
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }
    struct Tagged(&'static str, Arc<Log>);
    impl InterruptProbe for Tagged {
        fn fire_when_posted(&self, _: &mut Simulator, inum: u8) { self.1.push(format!("{} posted {inum}", self.0)); }
        fn fire_when_enabled(&self, _: &mut Simulator, inum: u8) { self.1.push(format!("{} enabled {inum}", self.0)); }
        fn fire_when_disabled(&self, _: &mut Simulator, inum: u8) { self.1.push(format!("{} disabled {inum}", self.0)); }
    }
    impl Notification for Tagged {
        fn force(&self, _: &mut Simulator, inum: u8) { self.1.push(format!("{} force {inum}", self.0)); }
    }

    #[test]
    fn test_probe_order_and_force() {
        let log = Arc::new(Log::default());
        let mut sim = Simulator::default();

        let global: InterruptProbeRef = Arc::new(Tagged("global", log.clone()));
        let local: InterruptProbeRef = Arc::new(Tagged("local", log.clone()));
        sim.interrupts_mut().insert_global_probe(global.clone());
        sim.interrupts_mut().insert_probe(3, local.clone()).unwrap();
        sim.interrupts_mut().register_notification(3, Arc::new(Tagged("device", log.clone()))).unwrap();

        sim.force_interrupt(3).unwrap();
        assert_eq!(log.take(), ["global posted 3", "local posted 3", "device force 3"]);

        sim.enable_interrupts();
        sim.disable_interrupts();
        assert_eq!(log.take(), ["global enabled 0", "global disabled 0"]);

        assert!(sim.interrupts_mut().remove_probe(3, &local));
        assert!(!sim.interrupts_mut().remove_probe(3, &local));
        sim.enable_interrupt(3).unwrap();
        assert_eq!(log.take(), ["global enabled 3"]);
        assert!(sim.interrupts().is_pending(3));
    }
}
