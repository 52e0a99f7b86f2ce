use bilge::prelude::*;
use defmt::Format;

use crate::interface::Interface;

/// An 8-bit register of the chip.
///
/// Default methods route through the [`Interface`] so typed register values
/// are the only thing the driver ever handles. `modify` skips the write-back
/// when nothing changed, which keeps read-modify-write sequences (antenna
/// enable in particular) idempotent.
pub trait Register: Copy + Sized + PartialEq + From<u8> + Into<u8> {
    const ADDRESS: u8;

    fn read<I: Interface>(iface: &mut I) -> Result<Self, I::Error> {
        let mut buf = [0u8; 1];
        iface.register_read(Self::ADDRESS, &mut buf)?;
        Ok(Self::from(buf[0]))
    }

    fn write<I: Interface>(self, iface: &mut I) -> Result<(), I::Error> {
        iface.register_write(Self::ADDRESS, &[self.into()])
    }

    fn modify<I: Interface>(
        iface: &mut I,
        mut f: impl FnMut(&mut Self),
    ) -> Result<(), I::Error> {
        let mut reg = Self::read::<I>(iface)?;
        let copy = reg;
        f(&mut reg);
        if reg != copy {
            reg.write::<I>(iface)
        } else {
            Ok(())
        }
    }
}

macro_rules! register_impl {
    ($type:ty, $addr:literal) => {
        impl Register for $type {
            const ADDRESS: u8 = $addr;
        }
    };
}

/// Opcodes executed by the chip's internal state machine
///
/// Datasheet section 10.3
#[bitsize(4)]
#[repr(u8)]
#[derive(FromBits, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommandCode {
    /// No action, cancels current command execution
    #[default]
    Idle = 0x0,
    /// Stores 25 bytes into the internal buffer
    Mem = 0x1,
    /// Generates a 10-byte random ID number
    GenerateRandomId = 0x2,
    /// Activates the CRC coprocessor
    CalcCrc = 0x3,
    /// Transmits data from the FIFO buffer
    Transmit = 0x4,
    /// Modify CommandReg bits without touching the running command
    NoCmdChange = 0x7,
    /// Activates the receiver circuits
    Receive = 0x8,
    /// Transmits data from the FIFO buffer and automatically activates the
    /// receiver after transmission
    Transceive = 0xC,
    /// MIFARE standard authentication as a reader
    MfAuthent = 0xE,
    /// Resets the chip
    SoftReset = 0xF,
    /// Catch-all for the reserved opcodes
    #[fallback]
    Reserved(u4),
}

impl Format for CommandCode {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=u8:04b}", u4::from(*self).value());
    }
}

register_impl!(Command, 0x01);
/// Starts and stops command execution
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct Command {
    pub command: CommandCode,
    /// Soft power-down mode; set by the chip while a reset is in progress
    pub power_down: bool,
    /// Analog part of the receiver switched off
    pub rcv_off: bool,
    reserved: u2,
}

impl Command {
    pub fn run(code: CommandCode) -> Self {
        let mut cmd = Self::default();
        cmd.set_command(code);
        cmd
    }
}

register_impl!(ComIrq, 0x04);
/// Interrupt request bits
///
/// Writing with `set1` clear clears the set flag bits.
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComIrq {
    /// The internal timer counted down to zero
    pub timer: bool,
    /// Any bit set in the error register
    pub err: bool,
    pub lo_alert: bool,
    pub hi_alert: bool,
    /// A command terminated on its own, e.g. the Idle command took over
    pub idle: bool,
    /// Receiver detected the end of a valid data stream
    pub rx: bool,
    /// The last bit of the transmitted data was sent out
    pub tx: bool,
    pub set1: bool,
}

impl ComIrq {
    /// Write-value that clears all seven request bits
    pub fn clear_all() -> Self {
        Self::from(0x7F)
    }
}

register_impl!(DivIrq, 0x05);
/// Second bank of interrupt request bits
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct DivIrq {
    reserved: u2,
    /// The CalcCRC command is done and all data is processed
    pub crc: bool,
    reserved: u1,
    pub mfin_act: bool,
    reserved: u2,
    pub set2: bool,
}

impl DivIrq {
    /// Write-value that clears the CRC request bit
    pub fn clear_crc() -> Self {
        let mut irq = Self::default();
        irq.set_crc(true);
        irq
    }
}

register_impl!(ErrorFlags, 0x06);
/// Error status of the last command executed
///
/// Datasheet section 9.3.1.7
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorFlags {
    /// SOF incorrect; only valid at 106 kBd
    pub protocol: bool,
    /// Parity check failed; only valid for ISO 14443A at 106 kBd
    pub parity: bool,
    /// The RxCRCEn bit is set and the CRC calculation failed
    pub crc: bool,
    /// A bit collision was detected; only valid during bitwise
    /// anticollision at 106 kBd
    pub collision: bool,
    /// FIFO is full and the host or internal state machine kept writing
    pub buffer_ovfl: bool,
    reserved: u1,
    /// Internal temperature sensor detected overheating
    pub temperature: bool,
    /// Host wrote to the FIFO during MFAuthent or an RF exchange
    pub write_access: bool,
}

register_impl!(FifoData, 0x09);
/// Input and output of the 64 byte FIFO buffer
///
/// Burst transfers go straight through the [`Interface`] with
/// [`FifoData::ADDRESS`]; the typed register is only the address carrier.
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct FifoData {
    pub value: u8,
}

register_impl!(FifoLevel, 0x0A);
/// Number of bytes stored in the FIFO buffer
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct FifoLevel {
    pub level: u7,
    /// Writing 1 immediately clears the FIFO
    pub flush_buffer: bool,
}

impl FifoLevel {
    pub fn flush() -> Self {
        let mut lvl = Self::default();
        lvl.set_flush_buffer(true);
        lvl
    }
}

register_impl!(Control, 0x0C);
/// Miscellaneous control bits
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct Control {
    /// Number of valid bits in the last received byte, 0 meaning the whole
    /// byte is valid
    pub rx_last_bits: u3,
    reserved: u3,
    pub t_start_now: bool,
    pub t_stop_now: bool,
}

register_impl!(BitFraming, 0x0D);
/// Adjustments for bit-oriented frames
///
/// Datasheet section 9.3.1.14
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitFraming {
    /// Number of bits of the last byte to transmit, 0 meaning all 8
    pub tx_last_bits: u3,
    reserved: u1,
    /// Bit position for the first received bit; used to pack a reply next
    /// to an already-known partial byte during anticollision
    pub rx_align: u3,
    /// Starts the transmission; only valid combined with Transceive
    pub start_send: bool,
}

register_impl!(Coll, 0x0E);
/// Bit position of the first detected collision
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coll {
    /// Position of the first collision, 0 meaning bit 32
    pub position: u5,
    /// No collision detected, or its position is outside the range the
    /// chip can report
    pub position_not_valid: bool,
    reserved: u1,
    /// When cleared, all received bits after a collision are kept
    pub values_after_coll: bool,
}

pub mod mode {
    use bilge::prelude::*;
    use defmt::Format;

    /// Preset of the CRC coprocessor, ISO 14443-3 wants 0x6363
    #[bitsize(2)]
    #[derive(FromBits, Debug, Format, Clone, Copy, Default, PartialEq, Eq)]
    pub enum CrcPreset {
        #[default]
        Preset0000 = 0b00,
        Preset6363 = 0b01,
        PresetA671 = 0b10,
        PresetFfff = 0b11,
    }
}

register_impl!(Mode, 0x11);
/// General modes for transmitting and receiving
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mode {
    pub crc_preset: mode::CrcPreset,
    reserved: u1,
    /// Polarity of pin MFIN
    pub pol_mfin: bool,
    reserved: u1,
    /// Transmitter can only be started if an RF field is generated
    pub tx_wait_rf: bool,
    reserved: u1,
    /// CRC coprocessor calculates with MSB first
    pub msb_first: bool,
}

register_impl!(TxMode, 0x12);
/// Transmission data rate and framing
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxMode {
    reserved: u3,
    pub inv_mod: bool,
    /// 0b000 is 106 kBd
    pub speed: u3,
    pub crc_en: bool,
}

register_impl!(RxMode, 0x13);
/// Reception data rate and framing
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxMode {
    reserved: u2,
    pub rx_multiple: bool,
    pub rx_no_err: bool,
    /// 0b000 is 106 kBd
    pub speed: u3,
    pub crc_en: bool,
}

register_impl!(TxControl, 0x14);
/// Logical behavior of the antenna driver pins TX1 and TX2
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxControl {
    /// TX1 delivers the 13.56 MHz carrier
    pub tx1_rf_en: bool,
    /// TX2 delivers the 13.56 MHz carrier
    pub tx2_rf_en: bool,
    reserved: u1,
    /// TX2 delivers a continuous, unmodulated carrier
    pub tx2_cw: bool,
    pub inv_tx1_rf_off: bool,
    pub inv_tx2_rf_off: bool,
    pub inv_tx1_rf_on: bool,
    pub inv_tx2_rf_on: bool,
}

register_impl!(TxAsk, 0x15);
/// Transmission modulation settings
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxAsk {
    reserved: u6,
    /// Force 100 % ASK modulation independent of the ModGsP setting
    pub force_100_ask: bool,
    reserved: u1,
}

register_impl!(CrcResultH, 0x21);
/// MSB of the CRC coprocessor result
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrcResultH {
    pub value: u8,
}

register_impl!(CrcResultL, 0x22);
/// LSB of the CRC coprocessor result
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrcResultL {
    pub value: u8,
}

register_impl!(ModWidth, 0x24);
/// Modulation width, reset value 0x26
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModWidth {
    pub value: u8,
}

register_impl!(TMode, 0x2A);
/// Internal timer settings; holds the prescaler high nibble
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct TMode {
    pub prescaler_hi: u4,
    pub t_auto_restart: bool,
    pub t_gated: u2,
    /// Timer starts automatically at the end of every transmission
    pub t_auto: bool,
}

register_impl!(TPrescaler, 0x2B);
/// Low 8 bits of the timer prescaler
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct TPrescaler {
    pub value: u8,
}

register_impl!(TReloadH, 0x2C);
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct TReloadH {
    pub value: u8,
}

register_impl!(TReloadL, 0x2D);
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct TReloadL {
    pub value: u8,
}

register_impl!(Version, 0x37);
/// Silicon/firmware revision
#[bitsize(8)]
#[derive(FromBits, DebugBits, Format, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version {
    pub value: u8,
}

/// Revision bytes the driver accepts, including the FM17522 clones that
/// are common on hobbyist boards.
pub const KNOWN_VERSIONS: [u8; 7] = [0x12, 0x88, 0x89, 0x90, 0x91, 0x92, 0xB2];

impl Version {
    pub fn is_known(&self) -> bool {
        KNOWN_VERSIONS.contains(&self.value())
    }
}
