#![no_std]

use bilge::arbitrary_int::u3;
use embedded_hal::delay::DelayNs;

use crate::iso14443a::Iso14443aInitiator;
use crate::registers::{
    BitFraming, ComIrq, Command, CommandCode, Control, CrcResultH, CrcResultL, DivIrq,
    ErrorFlags, FifoData, FifoLevel, ModWidth, Mode, Register, RxMode, TMode, TPrescaler,
    TReloadH, TReloadL, TxAsk, TxControl, TxMode, Version,
};

pub use crate::interface::{Interface, SpiInterface};

pub mod interface;
pub mod iso14443a;
pub mod registers;

#[cfg(test)]
pub(crate) mod testutil;

/// Interrupt poll cap per exchange, roughly 1 ms per iteration.
///
/// Together with the 25 ms chip timer this gives a hard ceiling of about
/// 30 ms per exchange.
const POLL_ATTEMPTS: u32 = 30;
const POLL_INTERVAL_MS: u32 = 1;
/// Bounded wait for the power-down bit to clear after a soft reset
const RESET_RETRIES: u32 = 3;
const RESET_SETTLE_MS: u32 = 50;
/// RF field settle time after enabling the antenna drivers
const RF_STARTUP_MS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum Error<E> {
    /// Bit collision on the RF interface; recoverable inside the
    /// anticollision loop, fatal everywhere else
    Collision,
    /// CRC check failed, either in the chip or recomputed by the driver
    BadCrc,
    /// The chip timer fired or the chip stopped answering
    Timeout,
    /// Protocol invariant violated; a bug or a misbehaving tag
    Internal,
    /// The caller's response buffer is smaller than the FIFO contents
    NoMemory,
    /// The version register holds a revision this driver does not know
    InvalidVersion(u8),
    /// Bus fault, always fatal
    Interface(E),
}

pub type Result<T, I> = core::result::Result<T, Error<<I as Interface>::Error>>;

/// Driver for the MFRC522 contactless reader IC.
///
/// Owns the bus interface and the delay provider; every operation takes
/// `&mut self`, so a device handle can never run two command sequences at
/// once.
pub struct Mfrc522<I, D> {
    pub(crate) iface: I,
    delay: D,
}

impl<I: Interface, D: DelayNs> Mfrc522<I, D> {
    /// Takes ownership of the interface and brings the chip up.
    ///
    /// Fails with [`Error::InvalidVersion`] when the version register does
    /// not report a known silicon revision; any bus fault aborts the
    /// sequence immediately.
    pub fn init(iface: I, delay: D) -> Result<Self, I> {
        let mut drv = Self { iface, delay };
        drv.soft_reset()?;

        // reset baud rates and modulation width to their 106 kBd defaults
        TxMode::default()
            .write(&mut drv.iface)
            .map_err(Error::Interface)?;
        RxMode::default()
            .write(&mut drv.iface)
            .map_err(Error::Interface)?;
        ModWidth::new(0x26)
            .write(&mut drv.iface)
            .map_err(Error::Interface)?;

        drv.init_timeout()?;

        // 100 % ASK modulation independent of the ModGsP setting
        let mut ask = TxAsk::default();
        ask.set_force_100_ask(true);
        ask.write(&mut drv.iface).map_err(Error::Interface)?;

        // CRC preset 0x6363 as ISO 14443-3 section 6.2.4 wants
        Mode::modify(&mut drv.iface, |r| {
            r.set_crc_preset(registers::mode::CrcPreset::Preset6363);
            r.set_tx_wait_rf(true);
        })
        .map_err(Error::Interface)?;

        drv.antenna_on()?;
        drv.delay.delay_ms(RF_STARTUP_MS);

        let version = Version::read(&mut drv.iface).map_err(Error::Interface)?;
        if !version.is_known() {
            return Err(Error::InvalidVersion(version.value()));
        }
        defmt::info!("MFRC522 up, version {=u8:#x}", version.value());
        Ok(drv)
    }

    /// Issues a soft reset and waits for the chip to come back.
    ///
    /// The datasheet gives no completion time for the reset itself, and the
    /// chip may have been in soft power-down; 50 ms per attempt is generous
    /// next to the 37.74 us oscillator start-up figure.
    pub fn soft_reset(&mut self) -> Result<(), I> {
        Command::run(CommandCode::SoftReset)
            .write(&mut self.iface)
            .map_err(Error::Interface)?;
        for _ in 0..RESET_RETRIES {
            self.delay.delay_ms(RESET_SETTLE_MS);
            let cmd = Command::read(&mut self.iface).map_err(Error::Interface)?;
            if !cmd.power_down() {
                return Ok(());
            }
        }
        Err(Error::Timeout)
    }

    /// Programs the chip timer as the per-exchange communication timeout.
    ///
    /// Prescaler 0x0A9 = 169 gives a 40 kHz tick (25 us), reload
    /// 0x3E8 = 1000 ticks a 25 ms deadline; with `t_auto` the countdown is
    /// armed at the end of every transmission.
    fn init_timeout(&mut self) -> Result<(), I> {
        let mut tmode = TMode::default();
        tmode.set_t_auto(true);
        tmode.write(&mut self.iface).map_err(Error::Interface)?;
        TPrescaler::new(0xA9)
            .write(&mut self.iface)
            .map_err(Error::Interface)?;
        TReloadH::new(0x03)
            .write(&mut self.iface)
            .map_err(Error::Interface)?;
        TReloadL::new(0xE8)
            .write(&mut self.iface)
            .map_err(Error::Interface)?;
        Ok(())
    }

    /// Enables the antenna drivers TX1 and TX2.
    ///
    /// A reset leaves them disabled. Goes through `modify`, so nothing is
    /// written when the drivers are already on.
    pub fn antenna_on(&mut self) -> Result<(), I> {
        TxControl::modify(&mut self.iface, |r| {
            r.set_tx1_rf_en(true);
            r.set_tx2_rf_en(true);
        })
        .map_err(Error::Interface)
    }

    /// Reads the raw version register
    pub fn version(&mut self) -> Result<u8, I> {
        Version::read(&mut self.iface)
            .map(|v| v.value())
            .map_err(Error::Interface)
    }

    /// One transmit/receive exchange with a tag.
    ///
    /// `tx_last_bits` is the number of valid bits in the last transmitted
    /// byte (0 meaning all 8); `rx_align` the bit position at which the
    /// first received bit lands. When `rx_align` is non-zero the low bits of
    /// the first response byte are taken from the caller's buffer, so a
    /// partially known byte is completed in place.
    ///
    /// Returns the number of response bytes and the valid-bit count of the
    /// last one (0 meaning all 8). On [`Error::Collision`] the partial
    /// response has still been copied out, the anticollision loop needs it.
    pub fn transceive(
        &mut self,
        tx: &[u8],
        tx_last_bits: u8,
        rx_align: u8,
        rx: Option<&mut [u8]>,
    ) -> Result<(usize, u8), I> {
        self.communicate(CommandCode::Transceive, tx, tx_last_bits, rx_align, rx)
    }

    fn communicate(
        &mut self,
        cmd: CommandCode,
        tx: &[u8],
        tx_last_bits: u8,
        rx_align: u8,
        rx: Option<&mut [u8]>,
    ) -> Result<(usize, u8), I> {
        // cancel whatever is running, clear stale interrupts, flush the FIFO
        Command::run(CommandCode::Idle)
            .write(&mut self.iface)
            .map_err(Error::Interface)?;
        ComIrq::clear_all()
            .write(&mut self.iface)
            .map_err(Error::Interface)?;
        FifoLevel::flush()
            .write(&mut self.iface)
            .map_err(Error::Interface)?;
        self.iface
            .register_write(FifoData::ADDRESS, tx)
            .map_err(Error::Interface)?;
        BitFraming::new(
            u3::new(tx_last_bits & 0b111),
            u3::new(rx_align & 0b111),
            false,
        )
        .write(&mut self.iface)
        .map_err(Error::Interface)?;
        Command::run(cmd)
            .write(&mut self.iface)
            .map_err(Error::Interface)?;
        if cmd == CommandCode::Transceive {
            BitFraming::modify(&mut self.iface, |r| r.set_start_send(true))
                .map_err(Error::Interface)?;
        }

        self.wait_for_completion()?;

        let flags = ErrorFlags::read(&mut self.iface).map_err(Error::Interface)?;
        // a collision must not short-circuit reading the response; the
        // partial bits are what lets the anticollision loop make progress
        let collided = match classify_errors(flags) {
            None => false,
            Some(Error::Collision) => true,
            Some(e) => return Err(e),
        };

        let mut bytes_read = 0;
        let mut rx_last_bits = 0;
        if let Some(rx) = rx {
            let level = FifoLevel::read(&mut self.iface)
                .map_err(Error::Interface)?
                .level()
                .value() as usize;
            if level > rx.len() {
                return Err(Error::NoMemory);
            }
            let first = rx.first().copied().unwrap_or(0);
            self.iface
                .register_read(FifoData::ADDRESS, &mut rx[..level])
                .map_err(Error::Interface)?;
            if rx_align != 0 && level > 0 {
                let mask = 0xFFu8 << rx_align;
                rx[0] = (first & !mask) | (rx[0] & mask);
            }
            rx_last_bits = Control::read(&mut self.iface)
                .map_err(Error::Interface)?
                .rx_last_bits()
                .value();
            bytes_read = level;
        }

        if collided {
            return Err(Error::Collision);
        }
        Ok((bytes_read, rx_last_bits))
    }

    /// Polls the interrupt request bits until the command finishes.
    ///
    /// The iteration cap bounds the wait even when communication with the
    /// chip itself is dead; the timer bit fires when the tag stayed silent
    /// for the 25 ms programmed in [`Self::init_timeout`].
    fn wait_for_completion(&mut self) -> Result<(), I> {
        for _ in 0..POLL_ATTEMPTS {
            let irq = ComIrq::read(&mut self.iface).map_err(Error::Interface)?;
            if irq.rx() || irq.idle() {
                return Ok(());
            }
            if irq.timer() {
                return Err(Error::Timeout);
            }
            self.delay.delay_ms(POLL_INTERVAL_MS);
        }
        Err(Error::Timeout)
    }

    /// Runs the CRC coprocessor over `data`.
    ///
    /// Returns the CRC_A in transmit order, low byte first.
    pub fn calculate_crc(&mut self, data: &[u8]) -> Result<[u8; 2], I> {
        Command::run(CommandCode::Idle)
            .write(&mut self.iface)
            .map_err(Error::Interface)?;
        DivIrq::clear_crc()
            .write(&mut self.iface)
            .map_err(Error::Interface)?;
        FifoLevel::flush()
            .write(&mut self.iface)
            .map_err(Error::Interface)?;
        self.iface
            .register_write(FifoData::ADDRESS, data)
            .map_err(Error::Interface)?;
        Command::run(CommandCode::CalcCrc)
            .write(&mut self.iface)
            .map_err(Error::Interface)?;

        for _ in 0..POLL_ATTEMPTS {
            let irq = DivIrq::read(&mut self.iface).map_err(Error::Interface)?;
            if irq.crc() {
                // stop the coprocessor before reading the result
                Command::run(CommandCode::Idle)
                    .write(&mut self.iface)
                    .map_err(Error::Interface)?;
                let lo = CrcResultL::read(&mut self.iface)
                    .map_err(Error::Interface)?
                    .value();
                let hi = CrcResultH::read(&mut self.iface)
                    .map_err(Error::Interface)?
                    .value();
                return Ok([lo, hi]);
            }
            self.delay.delay_ms(POLL_INTERVAL_MS);
        }
        Err(Error::Timeout)
    }

    /// Moves the device into the ISO 14443A protocol layer
    pub fn into_iso14443a_initiator(self) -> Iso14443aInitiator<I, D> {
        Iso14443aInitiator::new(self)
    }

    /// Gives back the interface and delay provider
    pub fn release(self) -> (I, D) {
        (self.iface, self.delay)
    }
}

/// Maps the error register onto the error taxonomy.
///
/// Collision wins over CRC, anything else that is set is an internal fault.
fn classify_errors<E>(flags: ErrorFlags) -> Option<Error<E>> {
    if flags.collision() {
        Some(Error::Collision)
    } else if flags.crc() {
        Some(Error::BadCrc)
    } else if flags.protocol()
        || flags.parity()
        || flags.buffer_ovfl()
        || flags.temperature()
        || flags.write_access()
    {
        Some(Error::Internal)
    } else {
        None
    }
}
