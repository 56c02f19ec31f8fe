//! Microcontroller properties.
//!
//! [`McuProps`] describes the part being simulated: its clock, memory sizes,
//! interrupt vector layout, and the location of the IO registers the core itself uses.

/// The number of general purpose registers.
pub const NUM_REGS: usize = 32;

/// The layout of a microcontroller.
///
/// The data space is laid out as the general purpose registers,
/// then the IO registers, then SRAM.
///
/// ```
/// use avr_sim::sim::McuProps;
///
/// let props = McuProps::atmega128();
/// assert_eq!(props.sram_start(), 0x100);
/// assert_eq!(props.ramend(), 0x10FF);
/// assert_eq!(props.interrupt_address(1), 0x0000);
/// assert_eq!(props.interrupt_address(17), 0x0040);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McuProps {
    /// The name of the part.
    pub name: String,
    /// The main clock frequency in hertz.
    pub hz: u64,
    /// The number of IO registers (including extended IO).
    ///
    /// This is at most 256.
    pub ioreg_size: usize,
    /// The size of SRAM in bytes.
    pub sram_size: usize,
    /// The size of flash in bytes.
    pub flash_size: usize,
    /// The size of a self-programming flash page in bytes.
    pub page_size: usize,
    /// The number of interrupt table slots.
    ///
    /// Vectors are numbered from 1 (reset), so slot 0 is never dispatched.
    pub num_interrupts: u8,
    /// The byte address of the first interrupt vector.
    pub interrupt_base: u32,
    /// The distance between interrupt vectors in bytes.
    pub interrupt_stride: u32,
    /// `SREG`.
    pub sreg: u8,
    /// `SPH`.
    pub sph: u8,
    /// `SPL`.
    pub spl: u8,
    /// `RAMPZ`.
    pub rampz: u8,
    /// `SPMCSR`.
    pub spmcsr: u8,
    /// The store program memory ready interrupt.
    pub spm_ready: u8,
}
impl McuProps {
    /// The ATmega128.
    pub fn atmega128() -> Self {
        Self {
            name: String::from("atmega128"),
            hz: 16_000_000,
            ioreg_size: 224,
            sram_size: 4096,
            flash_size: 128 * 1024,
            page_size: 256,
            num_interrupts: 36,
            interrupt_base: 0,
            interrupt_stride: 4,
            sreg: 0x3F,
            sph: 0x3E,
            spl: 0x3D,
            rampz: 0x3B,
            spmcsr: 0x68,
            spm_ready: 35,
        }
    }

    /// The data address of IO register 0.
    pub fn io_start(&self) -> usize {
        NUM_REGS
    }
    /// The data address of the first byte of SRAM.
    pub fn sram_start(&self) -> usize {
        NUM_REGS + self.ioreg_size
    }
    /// The size of the whole data space.
    pub fn data_size(&self) -> usize {
        self.sram_start() + self.sram_size
    }
    /// The last SRAM address, which the stack pointer starts at.
    pub fn ramend(&self) -> u16 {
        (self.data_size() - 1) as u16
    }

    /// The byte address of the handler of an interrupt vector.
    pub fn interrupt_address(&self, inum: u8) -> u32 {
        self.interrupt_base + u32::from(inum).saturating_sub(1) * self.interrupt_stride
    }

    /// Converts milliseconds to clock cycles, truncating.
    pub fn millis_to_cycles(&self, ms: f64) -> u64 {
        (ms * self.hz as f64 / 1000.0) as u64
    }
    /// Converts clock cycles to milliseconds.
    pub fn cycles_to_millis(&self, cycles: u64) -> f64 {
        1000.0 * cycles as f64 / self.hz as f64
    }
}
impl Default for McuProps {
    fn default() -> Self {
        Self::atmega128()
    }
}
