use embedded_hal::spi::{Operation, SpiDevice};

/// Byte transport to the chip's register file.
///
/// Kept free of chip state so the protocol layer can run against an
/// in-memory fake in tests.
pub trait Interface {
    type Error;
    /// Write one or more bytes to a register
    ///
    /// Multi-byte writes stream into the addressed register, which is how
    /// the FIFO data register is filled.
    fn register_write(&mut self, addr: u8, buf: &[u8]) -> Result<(), Self::Error>;
    /// Read one or more bytes from a register
    fn register_read(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), Self::Error>;
}

/// Register address framing, datasheet section 8.1.2
///
/// The address byte carries the register address in bits 1..=6; bit 7
/// distinguishes reads from writes.
pub mod spi_modes {
    pub const READ: u8 = 1 << 7;
    pub const ADDR_MASK: u8 = 0b0111_1110;

    pub const fn addr_byte(addr: u8) -> u8 {
        (addr << 1) & ADDR_MASK
    }
}

pub struct SpiInterface<S: SpiDevice> {
    dev: S,
}

impl<S: SpiDevice> Interface for SpiInterface<S> {
    type Error = S::Error;

    fn register_write(&mut self, addr: u8, buf: &[u8]) -> Result<(), Self::Error> {
        defmt::trace!("Register {=u8:X}, write {=[u8]:X}", addr, buf);
        self.dev.transaction(&mut [
            Operation::Write(&[spi_modes::addr_byte(addr)]),
            Operation::Write(buf),
        ])
    }

    fn register_read(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.dev.transaction(&mut [
            Operation::Write(&[spi_modes::addr_byte(addr) | spi_modes::READ]),
            Operation::Read(buf),
        ])?;
        defmt::trace!("Register {=u8:X}, read {=[u8]:X}", addr, buf);
        Ok(())
    }
}

impl<S: SpiDevice> SpiInterface<S> {
    pub fn new(dev: S) -> Self {
        Self { dev }
    }

    pub fn release(self) -> S {
        self.dev
    }
}
