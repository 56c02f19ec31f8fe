//! IO registers.
//!
//! The IO space is an array of [`IoReg`]s, mapped into the data space after the general purpose registers.
//! Devices hook into it with [`IoReg::Custom`].
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU8, Ordering};
//! use avr_sim::sim::ioreg::{ActiveRegister, IoReg};
//! use avr_sim::sim::{SimErr, Simulator};
//!
//! /// A register which reads back double whatever was written.
//! #[derive(Default)]
//! struct Doubler(AtomicU8);
//! impl ActiveRegister for Doubler {
//!     fn read(&self, _sim: &mut Simulator) -> u8 {
//!         self.0.load(Ordering::Relaxed).wrapping_mul(2)
//!     }
//!     fn write(&self, _sim: &mut Simulator, value: u8) -> Result<(), SimErr> {
//!         self.0.store(value, Ordering::Relaxed);
//!         Ok(())
//!     }
//! }
//!
//! let mut sim = Simulator::default();
//! sim.install_ioreg(0x10, IoReg::Custom(Arc::new(Doubler::default()))).unwrap();
//! sim.write_io(0x10, 21).unwrap();
//! assert_eq!(sim.read_io(0x10), 42);
//! ```

use std::sync::{Arc, Mutex, RwLock};

use super::interrupt::Notification;
use super::probe::{remove_ref, IoWatch, IoWatchRef};
use super::{SimErr, Simulator};

/// A register with behavior on access.
///
/// State needs interior mutability (or a [`Mutex`] / [`RwLock`] wrapper).
pub trait ActiveRegister: Send + Sync {
    /// Reads the register.
    fn read(&self, sim: &mut Simulator) -> u8;

    /// Writes the register.
    ///
    /// An error here is fatal to the simulation.
    fn write(&self, sim: &mut Simulator, value: u8) -> Result<(), SimErr>;

    /// Reads a single bit of the register.
    fn read_bit(&self, sim: &mut Simulator, bit: u8) -> bool {
        (self.read(sim) >> bit) & 1 != 0
    }

    /// Writes a single bit of the register.
    ///
    /// By default, this is a read-modify-write of the whole register.
    fn write_bit(&self, sim: &mut Simulator, bit: u8, value: bool) -> Result<(), SimErr> {
        let old = self.read(sim);
        self.write(sim, with_bit(old, bit, value))
    }
}
/// A shared [`ActiveRegister`] handle.
pub type ActiveRegisterRef = Arc<dyn ActiveRegister>;

fn with_bit(value: u8, bit: u8, set: bool) -> u8 {
    match set {
        true  => value | (1 << bit),
        false => value & !(1 << bit),
    }
}

/// Locks a register, recovering from poison.
///
/// This returns `None` if the register is already locked,
/// which happens when the register is re-entered from its own callback.
fn resolve_lock<G>(e: std::sync::TryLockResult<G>) -> Option<G> {
    use std::sync::TryLockError;

    match e {
        Ok(guard) => Some(guard),
        Err(TryLockError::WouldBlock) => None,
        Err(TryLockError::Poisoned(e)) => Some(e.into_inner())
    }
}
fn busy() {
    log::warn!("IO register re-entered while locked; access dropped");
}
impl<R: ActiveRegister> ActiveRegister for Mutex<R> {
    fn read(&self, sim: &mut Simulator) -> u8 {
        match resolve_lock(self.try_lock()) {
            Some(r) => r.read(sim),
            None => { busy(); 0 }
        }
    }
    fn write(&self, sim: &mut Simulator, value: u8) -> Result<(), SimErr> {
        match resolve_lock(self.try_lock()) {
            Some(r) => r.write(sim, value),
            None => { busy(); Ok(()) }
        }
    }
    fn read_bit(&self, sim: &mut Simulator, bit: u8) -> bool {
        match resolve_lock(self.try_lock()) {
            Some(r) => r.read_bit(sim, bit),
            None => { busy(); false }
        }
    }
    fn write_bit(&self, sim: &mut Simulator, bit: u8, value: bool) -> Result<(), SimErr> {
        match resolve_lock(self.try_lock()) {
            Some(r) => r.write_bit(sim, bit, value),
            None => { busy(); Ok(()) }
        }
    }
}
impl<R: ActiveRegister> ActiveRegister for RwLock<R> {
    fn read(&self, sim: &mut Simulator) -> u8 {
        match resolve_lock(self.try_write()) {
            Some(r) => r.read(sim),
            None => { busy(); 0 }
        }
    }
    fn write(&self, sim: &mut Simulator, value: u8) -> Result<(), SimErr> {
        match resolve_lock(self.try_write()) {
            Some(r) => r.write(sim, value),
            None => { busy(); Ok(()) }
        }
    }
    fn read_bit(&self, sim: &mut Simulator, bit: u8) -> bool {
        match resolve_lock(self.try_write()) {
            Some(r) => r.read_bit(sim, bit),
            None => { busy(); false }
        }
    }
    fn write_bit(&self, sim: &mut Simulator, bit: u8, value: bool) -> Result<(), SimErr> {
        match resolve_lock(self.try_write()) {
            Some(r) => r.write_bit(sim, bit, value),
            None => { busy(); Ok(()) }
        }
    }
}

/// An IO register.
pub enum IoReg {
    /// A plain read/write register.
    Plain(u8),
    /// The status register (`SREG`).
    Status,
    /// The low byte of the stack pointer (`SPL`).
    StackLow(u8),
    /// The high byte of the stack pointer (`SPH`).
    StackHigh(u8),
    /// The flag half of a masked interrupt.
    Flag(FlagRegister),
    /// The mask half of a masked interrupt.
    Mask(MaskRegister),
    /// A reserved register. Writes are dropped, or fatal under [`SimFlags::strict_io`].
    ///
    /// [`SimFlags::strict_io`]: super::SimFlags::strict_io
    Reserved,
    /// A device register.
    Custom(ActiveRegisterRef),
    /// A register with IO watches attached.
    Probed(Box<ProbedRegister>),
}
impl IoReg {
    /// The register under any watch wrapper.
    pub fn unwrapped(&self) -> &IoReg {
        match self {
            IoReg::Probed(p) => &p.inner,
            r => r
        }
    }
    fn unwrapped_mut(&mut self) -> &mut IoReg {
        match self {
            IoReg::Probed(p) => &mut p.inner,
            r => r
        }
    }

    /// The value stored in this register, if it is a storage-backed register.
    pub fn stored(&self) -> Option<u8> {
        match self.unwrapped() {
            IoReg::Plain(v) | IoReg::StackLow(v) | IoReg::StackHigh(v) => Some(*v),
            IoReg::Flag(r) => Some(r.value),
            IoReg::Mask(r) => Some(r.value),
            _ => None
        }
    }
    fn stored_mut(&mut self) -> Option<&mut u8> {
        match self.unwrapped_mut() {
            IoReg::Plain(v) | IoReg::StackLow(v) | IoReg::StackHigh(v) => Some(v),
            IoReg::Flag(r) => Some(&mut r.value),
            IoReg::Mask(r) => Some(&mut r.value),
            _ => None
        }
    }

    /// Whether this register has IO watches attached.
    pub fn is_probed(&self) -> bool {
        matches!(self, IoReg::Probed(_))
    }
}
impl std::fmt::Debug for IoReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain(v)     => f.debug_tuple("Plain").field(v).finish(),
            Self::Status       => f.write_str("Status"),
            Self::StackLow(v)  => f.debug_tuple("StackLow").field(v).finish(),
            Self::StackHigh(v) => f.debug_tuple("StackHigh").field(v).finish(),
            Self::Flag(r)      => f.debug_tuple("Flag").field(&r.value).finish(),
            Self::Mask(r)      => f.debug_tuple("Mask").field(&r.value).finish(),
            Self::Reserved     => f.write_str("Reserved"),
            Self::Custom(_)    => f.write_str("Custom(..)"),
            Self::Probed(p)    => f.debug_struct("Probed")
                .field("inner", &p.inner)
                .field("watches", &p.watches.len())
                .finish(),
        }
    }
}

/// A register wrapped with its IO watches.
pub struct ProbedRegister {
    inner: IoReg,
    watches: Vec<IoWatchRef>,
}
impl ProbedRegister {
    /// The wrapped register.
    pub fn inner(&self) -> &IoReg {
        &self.inner
    }
}

/// The flag register of a masked interrupt.
///
/// Writing a 1 to a bit clears it. Bits are set by the device through [`InterruptFlags::flag_bit`].
pub struct FlagRegister {
    value: u8,
    flags: Arc<InterruptFlags>,
}
/// The mask register of a masked interrupt.
pub struct MaskRegister {
    value: u8,
    flags: Arc<InterruptFlags>,
}

/// A flag and mask register pair which drives up to 8 interrupt vectors.
///
/// A flag bit posts its vector and the mask bit enables it.
///
/// ```
/// use avr_sim::sim::ioreg::InterruptFlags;
/// use avr_sim::sim::Simulator;
///
/// let mut sim = Simulator::default();
/// let tifr = InterruptFlags::new(0x36, 0x37)
///     .vector(0, 17)
///     .vector(1, 16)
///     .install(&mut sim)
///     .unwrap();
///
/// tifr.flag_bit(&mut sim, 0).unwrap();
/// assert!(sim.interrupts().is_posted(17));
/// assert!(!sim.interrupts().is_pending(17));
///
/// sim.write_io(0x37, 0b01).unwrap();
/// assert!(sim.interrupts().is_pending(17));
///
/// // writing a one clears the flag:
/// sim.write_io(0x36, 0b01).unwrap();
/// assert!(!sim.interrupts().is_posted(17));
/// ```
#[derive(Debug, Clone)]
pub struct InterruptFlags {
    flag_reg: u8,
    mask_reg: u8,
    vectors: [Option<u8>; 8],
    sticky: u8,
}
impl InterruptFlags {
    /// Describes a pair with the given flag and mask register numbers, and no vectors.
    pub fn new(flag_reg: u8, mask_reg: u8) -> Self {
        Self { flag_reg, mask_reg, vectors: [None; 8], sticky: 0 }
    }

    /// Maps a bit of the pair to an interrupt vector.
    ///
    /// The flag bit is cleared when the interrupt is dispatched.
    pub fn vector(mut self, bit: u8, inum: u8) -> Self {
        if let Some(v) = self.vectors.get_mut(usize::from(bit)) {
            *v = Some(inum);
            self.sticky &= !(1 << bit);
        }
        self
    }
    /// Maps a bit of the pair to an interrupt vector whose flag is not cleared on dispatch.
    pub fn sticky_vector(mut self, bit: u8, inum: u8) -> Self {
        if let Some(v) = self.vectors.get_mut(usize::from(bit)) {
            *v = Some(inum);
            self.sticky |= 1 << bit;
        }
        self
    }

    /// The flag register number.
    pub fn flag_reg(&self) -> u8 {
        self.flag_reg
    }
    /// The mask register number.
    pub fn mask_reg(&self) -> u8 {
        self.mask_reg
    }

    fn mapped(&self) -> impl Iterator<Item=(u8, u8)> + '_ {
        self.vectors.iter()
            .zip(0..)
            .filter_map(|(v, bit)| Some((bit, (*v)?)))
    }

    /// Installs both registers into the simulator and registers a [`MaskableInterrupt`]
    /// for each mapped vector.
    pub fn install(self, sim: &mut Simulator) -> Result<Arc<Self>, SimErr> {
        let flags = Arc::new(self);
        for (bit, inum) in flags.mapped() {
            let notify = MaskableInterrupt {
                flags: Arc::clone(&flags),
                bit,
                sticky: flags.sticky & (1 << bit) != 0,
            };
            sim.interrupts_mut().register_notification(inum, Arc::new(notify))?;
        }

        sim.install_ioreg(flags.flag_reg, IoReg::Flag(FlagRegister { value: 0, flags: Arc::clone(&flags) }))?;
        sim.install_ioreg(flags.mask_reg, IoReg::Mask(MaskRegister { value: 0, flags: Arc::clone(&flags) }))?;
        Ok(flags)
    }

    /// The current value of the flag register.
    pub fn flags(&self, sim: &Simulator) -> u8 {
        sim.ioreg(self.flag_reg).and_then(IoReg::stored).unwrap_or(0)
    }
    /// The current value of the mask register.
    pub fn mask(&self, sim: &Simulator) -> u8 {
        sim.ioreg(self.mask_reg).and_then(IoReg::stored).unwrap_or(0)
    }

    /// Sets a flag bit, posting its interrupt.
    pub fn flag_bit(&self, sim: &mut Simulator, bit: u8) -> Result<(), SimErr> {
        self.update_flags(sim, |f| with_bit(f, bit, true))
    }
    /// Clears a flag bit, unposting its interrupt.
    pub fn clear_flag_bit(&self, sim: &mut Simulator, bit: u8) -> Result<(), SimErr> {
        self.update_flags(sim, |f| with_bit(f, bit, false))
    }

    fn update_flags(&self, sim: &mut Simulator, f: impl FnOnce(u8) -> u8) -> Result<(), SimErr> {
        let Some(value) = sim.ioregs.get_mut(usize::from(self.flag_reg)).and_then(IoReg::stored_mut) else {
            return Ok(());
        };
        let old = *value;
        *value = f(old);
        let new = *value;
        self.sync_posted(sim, old, new)
    }

    /// Posts or unposts each vector whose flag bit changed.
    fn sync_posted(&self, sim: &mut Simulator, old: u8, new: u8) -> Result<(), SimErr> {
        for (bit, inum) in self.mapped().filter(|&(b, _)| (old ^ new) & (1 << b) != 0) {
            sim.set_posted(inum, new & (1 << bit) != 0)?;
        }
        Ok(())
    }
    /// Enables or disables each vector whose mask bit changed.
    fn sync_enabled(&self, sim: &mut Simulator, old: u8, new: u8) -> Result<(), SimErr> {
        for (bit, inum) in self.mapped().filter(|&(b, _)| (old ^ new) & (1 << b) != 0) {
            sim.set_enabled(inum, new & (1 << bit) != 0)?;
        }
        Ok(())
    }
}

/// The [`Notification`] of one bit of an [`InterruptFlags`] pair.
pub struct MaskableInterrupt {
    flags: Arc<InterruptFlags>,
    bit: u8,
    sticky: bool,
}
impl Notification for MaskableInterrupt {
    fn force(&self, sim: &mut Simulator, inum: u8) {
        if let Err(e) = self.flags.flag_bit(sim, self.bit) {
            log::warn!("could not force interrupt {inum}: {e}");
        }
    }

    fn invoke(&self, sim: &mut Simulator, inum: u8) {
        if self.sticky { return; }
        if let Err(e) = self.flags.clear_flag_bit(sim, self.bit) {
            log::warn!("could not clear flag of interrupt {inum}: {e}");
        }
    }
}

type WatchFn<T> = fn(&dyn IoWatch, &mut Simulator, u8, T);

impl Simulator {
    fn io_oob(ioreg: u8) -> SimErr {
        SimErr::AddressOutOfBounds { segment: String::from("io"), address: usize::from(ioreg) }
    }

    fn io_watches(&self, ioreg: u8) -> Option<Vec<IoWatchRef>> {
        match self.ioregs.get(usize::from(ioreg))? {
            IoReg::Probed(p) => Some(p.watches.clone()),
            _ => None
        }
    }
    fn fire_io_watches<T: Copy>(&mut self, watches: &[IoWatchRef], ioreg: u8, value: T, f: WatchFn<T>) {
        for w in watches {
            f(&**w, self, ioreg, value);
        }
    }

    /// Gets the IO register with the given number.
    pub fn ioreg(&self, ioreg: u8) -> Option<&IoReg> {
        self.ioregs.get(usize::from(ioreg))
    }

    /// Replaces the IO register with the given number.
    ///
    /// If the register being replaced has watches, they are kept on the new register.
    pub fn install_ioreg(&mut self, ioreg: u8, reg: IoReg) -> Result<(), SimErr> {
        let reg = match reg {
            IoReg::Probed(p) => p.inner,
            r => r
        };
        let slot = self.ioregs.get_mut(usize::from(ioreg)).ok_or_else(|| Self::io_oob(ioreg))?;
        *slot.unwrapped_mut() = reg;
        Ok(())
    }

    /// Reads an IO register as simulated code, firing any IO watches.
    pub fn read_io(&mut self, ioreg: u8) -> u8 {
        let Some(watches) = self.io_watches(ioreg) else {
            return self.read_io_unwatched(ioreg);
        };

        self.fire_io_watches(&watches, ioreg, (), |w, s, n, ()| w.fire_before_read(s, n));
        let value = self.read_io_unwatched(ioreg);
        self.fire_io_watches(&watches, ioreg, value, |w, s, n, v| w.fire_after_read(s, n, v));
        value
    }

    /// Writes an IO register as simulated code, firing any IO watches.
    pub fn write_io(&mut self, ioreg: u8, value: u8) -> Result<(), SimErr> {
        let Some(watches) = self.io_watches(ioreg) else {
            return self.write_io_unwatched(ioreg, value);
        };

        self.fire_io_watches(&watches, ioreg, value, |w, s, n, v| w.fire_before_write(s, n, v));
        self.write_io_unwatched(ioreg, value)?;
        self.fire_io_watches(&watches, ioreg, value, |w, s, n, v| w.fire_after_write(s, n, v));
        Ok(())
    }

    /// Reads a single bit of an IO register as simulated code, firing any IO watches.
    pub fn read_io_bit(&mut self, ioreg: u8, bit: u8) -> bool {
        let Some(watches) = self.io_watches(ioreg) else {
            return self.read_io_bit_unwatched(ioreg, bit);
        };

        self.fire_io_watches(&watches, ioreg, bit, |w, s, n, b| w.fire_before_bit_read(s, n, b));
        let value = self.read_io_bit_unwatched(ioreg, bit);
        for w in &watches {
            w.fire_after_bit_read(self, ioreg, bit, value);
        }
        value
    }

    /// Writes a single bit of an IO register as simulated code, firing any IO watches.
    pub fn write_io_bit(&mut self, ioreg: u8, bit: u8, value: bool) -> Result<(), SimErr> {
        let Some(watches) = self.io_watches(ioreg) else {
            return self.write_io_bit_unwatched(ioreg, bit, value);
        };

        for w in &watches {
            w.fire_before_bit_write(self, ioreg, bit, value);
        }
        self.write_io_bit_unwatched(ioreg, bit, value)?;
        for w in &watches {
            w.fire_after_bit_write(self, ioreg, bit, value);
        }
        Ok(())
    }

    fn read_io_unwatched(&mut self, ioreg: u8) -> u8 {
        let Some(reg) = self.ioregs.get(usize::from(ioreg)) else {
            log::warn!("read of nonexistent IO register 0x{ioreg:02X}");
            return 0;
        };

        match reg.unwrapped() {
            IoReg::Plain(v) | IoReg::StackLow(v) | IoReg::StackHigh(v) => *v,
            IoReg::Status => self.sreg.bits(),
            IoReg::Flag(r) => r.value,
            IoReg::Mask(r) => r.value,
            IoReg::Custom(r) => {
                let r = Arc::clone(r);
                r.read(self)
            },
            // wrappers are never nested
            IoReg::Reserved | IoReg::Probed(_) => 0,
        }
    }

    fn read_io_bit_unwatched(&mut self, ioreg: u8, bit: u8) -> bool {
        if let Some(IoReg::Custom(r)) = self.ioregs.get(usize::from(ioreg)).map(IoReg::unwrapped) {
            let r = Arc::clone(r);
            return r.read_bit(self, bit);
        }
        (self.read_io_unwatched(ioreg) >> bit) & 1 != 0
    }

    fn write_io_unwatched(&mut self, ioreg: u8, value: u8) -> Result<(), SimErr> {
        let reg = self.ioregs.get_mut(usize::from(ioreg))
            .ok_or_else(|| Self::io_oob(ioreg))?
            .unwrapped_mut();

        match reg {
            IoReg::Plain(v) | IoReg::StackLow(v) | IoReg::StackHigh(v) => *v = value,
            IoReg::Status => self.set_sreg(value),
            IoReg::Flag(r) => {
                let old = r.value;
                r.value &= !value;
                let (new, flags) = (r.value, Arc::clone(&r.flags));
                flags.sync_posted(self, old, new)?;
            },
            IoReg::Mask(r) => {
                let old = std::mem::replace(&mut r.value, value);
                let flags = Arc::clone(&r.flags);
                flags.sync_enabled(self, old, value)?;
            },
            IoReg::Reserved => self.reserved_write(ioreg, value)?,
            IoReg::Custom(r) => {
                let r = Arc::clone(r);
                r.write(self, value)?;
            },
            IoReg::Probed(_) => {},
        }
        Ok(())
    }

    fn write_io_bit_unwatched(&mut self, ioreg: u8, bit: u8, value: bool) -> Result<(), SimErr> {
        let reg = self.ioregs.get_mut(usize::from(ioreg))
            .ok_or_else(|| Self::io_oob(ioreg))?
            .unwrapped_mut();

        match reg {
            // writing a one clears only the addressed flag
            IoReg::Flag(_) if value => self.write_io_unwatched(ioreg, 1 << bit),
            IoReg::Flag(_) => Ok(()),
            IoReg::Custom(r) => {
                let r = Arc::clone(r);
                r.write_bit(self, bit, value)
            },
            _ => {
                let old = self.read_io_unwatched(ioreg);
                self.write_io_unwatched(ioreg, with_bit(old, bit, value))
            }
        }
    }

    fn reserved_write(&self, ioreg: u8, value: u8) -> Result<(), SimErr> {
        match self.flags.strict_io {
            true  => Err(SimErr::ReservedRegisterWrite { ioreg, value }),
            false => {
                log::warn!("write of 0x{value:02X} to reserved IO register 0x{ioreg:02X} dropped");
                Ok(())
            }
        }
    }

    /// The value of a storage-backed IO register, without side effects.
    pub(super) fn io_stored(&self, ioreg: u8) -> u8 {
        self.ioregs.get(usize::from(ioreg))
            .and_then(IoReg::stored)
            .unwrap_or(0)
    }
    /// Sets the value of a storage-backed IO register, without side effects.
    pub(super) fn set_io_stored(&mut self, ioreg: u8, value: u8) {
        if let Some(v) = self.ioregs.get_mut(usize::from(ioreg)).and_then(IoReg::stored_mut) {
            *v = value;
        }
    }

    /// Adds an IO watch to a register.
    ///
    /// Watches on the same register fire in insertion order.
    pub fn insert_io_watch(&mut self, ioreg: u8, watch: IoWatchRef) -> Result<(), SimErr> {
        let slot = self.ioregs.get_mut(usize::from(ioreg)).ok_or_else(|| Self::io_oob(ioreg))?;
        match slot {
            IoReg::Probed(p) => p.watches.push(watch),
            reg => {
                let inner = std::mem::replace(reg, IoReg::Reserved);
                *reg = IoReg::Probed(Box::new(ProbedRegister { inner, watches: vec![watch] }));
            }
        }
        Ok(())
    }

    /// Removes an IO watch from a register, comparing by reference identity.
    ///
    /// Once the last watch is removed, the register is unwrapped.
    pub fn remove_io_watch(&mut self, ioreg: u8, watch: &IoWatchRef) -> bool {
        let i = usize::from(ioreg);
        let Some(IoReg::Probed(p)) = self.ioregs.get_mut(i) else { return false };
        if !remove_ref(&mut p.watches, watch) { return false; }

        if p.watches.is_empty() {
            let slot = &mut self.ioregs[i];
            if let IoReg::Probed(p) = std::mem::replace(slot, IoReg::Reserved) {
                *slot = p.inner;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::{Arc, Mutex};

    use crate::sim::probe::{IoWatch, IoWatchRef};
    use crate::sim::{SimErr, SimFlags, Simulator};

    use super::{ActiveRegister, InterruptFlags, IoReg};

    #[derive(Default)]
    struct Latch(AtomicU8);
    impl ActiveRegister for Latch {
        fn read(&self, _: &mut Simulator) -> u8 {
            self.0.load(Ordering::Relaxed)
        }
        fn write(&self, _: &mut Simulator, value: u8) -> Result<(), SimErr> {
            self.0.store(value, Ordering::Relaxed);
            Ok(())
        }
    }

    struct Recorder(Arc<Mutex<Vec<String>>>);
    impl IoWatch for Recorder {
        fn fire_before_read(&self, _: &mut Simulator, ioreg: u8) {
            self.0.lock().unwrap().push(format!("before read {ioreg:#x}"));
        }
        fn fire_after_read(&self, _: &mut Simulator, ioreg: u8, value: u8) {
            self.0.lock().unwrap().push(format!("after read {ioreg:#x} = {value}"));
        }
        fn fire_before_write(&self, _: &mut Simulator, ioreg: u8, value: u8) {
            self.0.lock().unwrap().push(format!("before write {ioreg:#x} = {value}"));
        }
        fn fire_after_write(&self, _: &mut Simulator, ioreg: u8, value: u8) {
            self.0.lock().unwrap().push(format!("after write {ioreg:#x} = {value}"));
        }
        fn fire_after_bit_write(&self, _: &mut Simulator, ioreg: u8, bit: u8, value: bool) {
            self.0.lock().unwrap().push(format!("bit {ioreg:#x}.{bit} = {value}"));
        }
    }

    #[test]
    fn test_plain_and_bits() {
        let mut sim = Simulator::default();
        sim.write_io(0x18, 0b1010).unwrap();
        assert_eq!(sim.read_io(0x18), 0b1010);

        sim.write_io_bit(0x18, 0, true).unwrap();
        sim.write_io_bit(0x18, 3, false).unwrap();
        assert_eq!(sim.read_io(0x18), 0b0011);
        assert!(sim.read_io_bit(0x18, 1));
        assert!(!sim.read_io_bit(0x18, 2));
    }

    #[test]
    fn test_watch_wrap_and_unwrap() {
        let log = Arc::new(Mutex::new(vec![]));
        let mut sim = Simulator::default();
        let w: IoWatchRef = Arc::new(Recorder(log.clone()));

        sim.install_ioreg(0x20, IoReg::Plain(7)).unwrap();
        sim.insert_io_watch(0x20, w.clone()).unwrap();
        assert!(sim.ioreg(0x20).is_some_and(IoReg::is_probed));

        assert_eq!(sim.read_io(0x20), 7);
        sim.write_io(0x20, 9).unwrap();
        sim.write_io_bit(0x20, 1, true).unwrap();
        assert_eq!(*log.lock().unwrap(), [
            "before read 0x20",
            "after read 0x20 = 7",
            "before write 0x20 = 9",
            "after write 0x20 = 9",
            "bit 0x20.1 = true",
        ]);

        // replacing a watched register keeps its watches
        sim.install_ioreg(0x20, IoReg::Plain(1)).unwrap();
        assert!(sim.ioreg(0x20).is_some_and(IoReg::is_probed));

        assert!(sim.remove_io_watch(0x20, &w));
        assert!(!sim.remove_io_watch(0x20, &w));
        assert!(matches!(sim.ioreg(0x20), Some(IoReg::Plain(1))));
    }

    #[test]
    fn test_reserved_write() {
        let mut sim = Simulator::default();
        sim.install_ioreg(0x05, IoReg::Reserved).unwrap();
        assert!(sim.write_io(0x05, 1).is_ok());
        assert_eq!(sim.read_io(0x05), 0);

        let mut strict = Simulator::new(SimFlags { strict_io: true, ..Default::default() });
        strict.install_ioreg(0x05, IoReg::Reserved).unwrap();
        assert!(matches!(
            strict.write_io(0x05, 1),
            Err(SimErr::ReservedRegisterWrite { ioreg: 0x05, value: 1 })
        ));
    }

    #[test]
    fn test_locked_register() {
        let mut sim = Simulator::default();
        let reg = Arc::new(Mutex::new(Latch::default()));
        sim.install_ioreg(0x11, IoReg::Custom(reg.clone())).unwrap();
        sim.write_io(0x11, 0x55).unwrap();
        assert_eq!(sim.read_io(0x11), 0x55);
        assert_eq!(reg.lock().unwrap().0.load(Ordering::Relaxed), 0x55);
    }

    #[test]
    fn test_masked_interrupt() {
        let mut sim = Simulator::default();
        let pair = InterruptFlags::new(0x36, 0x37)
            .vector(0, 17)
            .sticky_vector(2, 15)
            .install(&mut sim)
            .unwrap();

        sim.write_io(0x37, 0b101).unwrap();
        assert!(sim.interrupts().is_enabled(17));
        assert!(sim.interrupts().is_enabled(15));

        pair.flag_bit(&mut sim, 0).unwrap();
        pair.flag_bit(&mut sim, 2).unwrap();
        assert!(sim.interrupts().is_pending(17));
        assert!(sim.interrupts().is_pending(15));
        assert_eq!(pair.flags(&sim), 0b101);

        // dispatch auto-clears the non-sticky flag only
        sim.before_invoke(17);
        sim.before_invoke(15);
        assert_eq!(pair.flags(&sim), 0b100);
        assert!(!sim.interrupts().is_posted(17));
        assert!(sim.interrupts().is_posted(15));

        // clearing a mask bit disables its vector
        sim.write_io(0x37, 0b001).unwrap();
        assert!(!sim.interrupts().is_enabled(15));
        assert!(sim.interrupts().is_posted(15));

        // force sets the flag bit
        sim.force_interrupt(17).unwrap();
        assert_eq!(pair.flags(&sim), 0b101);
    }
}
