//! In-memory chip and tag model backing the unit tests.
//!
//! [`PiccSim`] implements [`Interface`] with enough of the register file,
//! FIFO and command state machine to exercise the driver end to end, and
//! answers RF exchanges on behalf of a single scripted tag.

extern crate std;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::vec::Vec;

use embedded_hal::delay::DelayNs;

use crate::interface::Interface;
use crate::registers::{
    BitFraming, Coll, ComIrq, Command, Control, CrcResultH, CrcResultL, DivIrq, ErrorFlags,
    FifoData, FifoLevel, ModWidth, Mode, Register, TxControl, Version,
};

/// Swallows defmt output so host tests link without a probe attached
#[defmt::global_logger]
struct SinkLogger;

unsafe impl defmt::Logger for SinkLogger {
    fn acquire() {}
    unsafe fn flush() {}
    unsafe fn release() {}
    unsafe fn write(_bytes: &[u8]) {}
}

pub struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

/// ISO 14443-3 CRC_A reference implementation
pub fn crc_a(data: &[u8]) -> [u8; 2] {
    let mut crc: u16 = 0x6363;
    for &b in data {
        let mut ch = b ^ (crc as u8);
        ch ^= ch << 4;
        crc = (crc >> 8) ^ (u16::from(ch) << 8) ^ (u16::from(ch) << 3) ^ (u16::from(ch) >> 4);
    }
    crc.to_le_bytes()
}

/// Register traffic as seen on the bus, one entry per transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read(u8),
    Write(u8),
}

/// Scripted deviation for the next RF exchange
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// The tag stays silent, the chip timer fires
    Timeout,
    /// Bit collision at the given 1-based UID bit position
    CollisionAt(u8),
    /// Collision with the position-not-valid flag raised
    CollisionInvalid,
}

struct Card {
    uid: Vec<u8>,
    sak_final: u8,
}

impl Card {
    fn levels(&self) -> usize {
        match self.uid.len() {
            4 => 1,
            7 => 2,
            10 => 3,
            n => panic!("unsupported uid length {}", n),
        }
    }

    /// The 4-byte chunk sent at a cascade level, Cascade Tag included
    fn chunk(&self, level: usize) -> [u8; 4] {
        let u = &self.uid;
        match (u.len(), level) {
            (4, 0) => [u[0], u[1], u[2], u[3]],
            (7, 0) | (10, 0) => [0x88, u[0], u[1], u[2]],
            (7, 1) => [u[3], u[4], u[5], u[6]],
            (10, 1) => [0x88, u[3], u[4], u[5]],
            (10, 2) => [u[6], u[7], u[8], u[9]],
            _ => panic!("no cascade level {} for this uid", level),
        }
    }

    fn sak(&self, level: usize) -> u8 {
        if level + 1 < self.levels() {
            0x04
        } else {
            self.sak_final
        }
    }
}

pub struct PiccSim {
    regs: [u8; 64],
    fifo: VecDeque<u8>,
    card: Option<Card>,
    scripts: VecDeque<Script>,
    corrupt_sak_crc: bool,
    transceive_pending: bool,
    ops: Rc<RefCell<Vec<Op>>>,
}

impl PiccSim {
    fn new(card: Option<Card>) -> Self {
        let mut sim = Self {
            regs: [0; 64],
            fifo: VecDeque::new(),
            card,
            scripts: VecDeque::new(),
            corrupt_sak_crc: false,
            transceive_pending: false,
            ops: Rc::new(RefCell::new(Vec::new())),
        };
        sim.regs[usize::from(Version::ADDRESS)] = 0x92;
        sim.reset_defaults();
        sim
    }

    pub fn without_card() -> Self {
        Self::new(None)
    }

    pub fn with_card(uid: &[u8], sak: u8) -> Self {
        Self::new(Some(Card {
            uid: uid.to_vec(),
            sak_final: sak,
        }))
    }

    /// Queues a deviation; scripts are consumed in order, one per exchange
    pub fn script(&mut self, s: Script) {
        self.scripts.push_back(s);
    }

    pub fn corrupt_sak_crc(&mut self) {
        self.corrupt_sak_crc = true;
    }

    pub fn set_version(&mut self, v: u8) {
        self.regs[usize::from(Version::ADDRESS)] = v;
    }

    /// Current raw value of a register
    pub fn reg(&self, addr: u8) -> u8 {
        self.regs[usize::from(addr)]
    }

    /// Shared handle to the bus traffic log
    pub fn ops_log(&self) -> Rc<RefCell<Vec<Op>>> {
        Rc::clone(&self.ops)
    }

    /// Power-on defaults; the version byte models silicon and survives
    fn reset_defaults(&mut self) {
        let version = self.regs[usize::from(Version::ADDRESS)];
        self.regs = [0; 64];
        self.regs[usize::from(Command::ADDRESS)] = 0x20;
        self.regs[usize::from(Coll::ADDRESS)] = 0x80;
        self.regs[usize::from(Mode::ADDRESS)] = 0x3F;
        self.regs[usize::from(TxControl::ADDRESS)] = 0x80;
        self.regs[usize::from(ModWidth::ADDRESS)] = 0x26;
        self.regs[usize::from(Version::ADDRESS)] = version;
        self.fifo.clear();
        self.transceive_pending = false;
    }

    fn set_irq(&mut self, bits: u8) {
        self.regs[usize::from(ComIrq::ADDRESS)] |= bits;
    }

    fn apply_write(&mut self, addr: u8, value: u8) {
        match addr {
            a if a == FifoData::ADDRESS => self.fifo.push_back(value),
            a if a == FifoLevel::ADDRESS => {
                if value & 0x80 != 0 {
                    self.fifo.clear();
                }
            }
            // irq registers clear the masked bits when the set bit is low
            a if a == ComIrq::ADDRESS || a == DivIrq::ADDRESS => {
                let reg = &mut self.regs[usize::from(a)];
                if value & 0x80 == 0 {
                    *reg &= !(value & 0x7F);
                } else {
                    *reg |= value & 0x7F;
                }
            }
            a if a == Command::ADDRESS => {
                self.regs[usize::from(a)] = value;
                match value & 0x0F {
                    0x0F => self.reset_defaults(),
                    0x03 => self.run_crc(),
                    0x0C => self.transceive_pending = true,
                    0x00 => self.transceive_pending = false,
                    _ => (),
                }
            }
            a if a == BitFraming::ADDRESS => {
                self.regs[usize::from(a)] = value;
                if value & 0x80 != 0 && self.transceive_pending {
                    self.execute_transceive();
                }
            }
            a => self.regs[usize::from(a & 0x3F)] = value,
        }
    }

    fn read_one(&mut self, addr: u8) -> u8 {
        match addr {
            a if a == FifoData::ADDRESS => self.fifo.pop_front().unwrap_or(0),
            a if a == FifoLevel::ADDRESS => self.fifo.len() as u8,
            a => self.regs[usize::from(a & 0x3F)],
        }
    }

    fn run_crc(&mut self) {
        let data: Vec<u8> = self.fifo.drain(..).collect();
        let crc = crc_a(&data);
        self.regs[usize::from(CrcResultL::ADDRESS)] = crc[0];
        self.regs[usize::from(CrcResultH::ADDRESS)] = crc[1];
        self.regs[usize::from(DivIrq::ADDRESS)] |= 0x04;
    }

    fn set_collision(&mut self, raw: u8) {
        self.regs[usize::from(ErrorFlags::ADDRESS)] = 0x08;
        let coll = &mut self.regs[usize::from(Coll::ADDRESS)];
        *coll = (*coll & 0x80) | (raw & 0x3F);
    }

    /// One RF exchange: everything the host loaded is the frame, the tag
    /// answer lands in the FIFO
    fn execute_transceive(&mut self) {
        self.transceive_pending = false;
        self.regs[usize::from(ErrorFlags::ADDRESS)] = 0;
        let tx: Vec<u8> = self.fifo.drain(..).collect();
        let bf = self.regs[usize::from(BitFraming::ADDRESS)];
        let tx_last_bits = bf & 0x07;

        if self.card.is_none() {
            self.set_irq(0x01);
            return;
        }

        let script = self.scripts.pop_front();
        match script {
            Some(Script::Timeout) => {
                self.set_irq(0x01);
                return;
            }
            Some(Script::CollisionInvalid) => {
                self.set_collision(0x20);
                self.set_irq(0x20);
                return;
            }
            _ => (),
        }

        // 7-bit short frame, REQA or WUPA
        if tx_last_bits == 7 && tx.len() == 1 && (tx[0] == 0x26 || tx[0] == 0x52) {
            if let Some(Script::CollisionAt(pos)) = script {
                self.fifo.push_back(0x04);
                self.set_collision(if pos == 32 { 0 } else { pos });
                self.set_irq(0x20);
                return;
            }
            self.fifo.push_back(0x04);
            self.fifo.push_back(0x00);
            self.regs[usize::from(Control::ADDRESS)] = 0;
            self.set_irq(0x20);
            return;
        }

        // SELECT/ANTICOLLISION frames
        if !tx.is_empty() && matches!(tx[0], 0x93 | 0x95 | 0x97) {
            let level = usize::from((tx[0] - 0x93) / 2);
            let nvb = tx[1];
            if nvb == 0x70 {
                self.answer_select(level, &tx);
            } else {
                self.answer_anticollision(level, nvb, script);
            }
            return;
        }

        // anything else goes unanswered
        self.set_irq(0x01);
    }

    fn answer_select(&mut self, level: usize, tx: &[u8]) {
        let card = self.card.as_ref().unwrap();
        let chunk = card.chunk(level);
        assert_eq!(tx.len(), 9, "select frame must be 9 bytes");
        assert_eq!(&tx[2..6], &chunk, "selected uid chunk mismatch");
        let bcc = chunk.iter().fold(0, |acc, b| acc ^ b);
        assert_eq!(tx[6], bcc, "bcc mismatch");
        assert_eq!(&tx[7..9], &crc_a(&tx[..7]), "frame crc mismatch");

        let sak = card.sak(level);
        let mut crc = crc_a(&[sak]);
        if self.corrupt_sak_crc {
            crc[0] ^= 0xFF;
        }
        self.fifo.push_back(sak);
        self.fifo.push_back(crc[0]);
        self.fifo.push_back(crc[1]);
        self.regs[usize::from(Control::ADDRESS)] = 0;
        self.set_irq(0x20);
    }

    /// Answers the anticollision frame from `known` bits on, optionally
    /// cutting the reply short at a scripted collision position
    fn answer_anticollision(&mut self, level: usize, nvb: u8, script: Option<Script>) {
        let card = self.card.as_ref().unwrap();
        let chunk = card.chunk(level);
        let bcc = chunk.iter().fold(0, |acc, b| acc ^ b);
        let full = [chunk[0], chunk[1], chunk[2], chunk[3], bcc];
        let known = usize::from(((nvb >> 4) - 2) * 8 + (nvb & 0x0F));

        if let Some(Script::CollisionAt(pos)) = script {
            let pos = usize::from(pos);
            assert!(pos >= 1 && pos <= 32, "collision position out of range");
            // bytes covering the valid bits up to the collision, garbage
            // bits at and beyond it zeroed
            let last = (pos - 1) / 8;
            for (i, &b) in full.iter().enumerate().take(last + 1).skip(known / 8) {
                let b = if i == last {
                    b & ((1u8 << ((pos - 1) % 8)) - 1)
                } else {
                    b
                };
                self.fifo.push_back(b);
            }
            self.regs[usize::from(Control::ADDRESS)] = ((pos - 1) % 8) as u8;
            self.set_collision(if pos == 32 { 0 } else { pos as u8 });
            self.set_irq(0x20);
            return;
        }

        for &b in &full[known / 8..] {
            self.fifo.push_back(b);
        }
        self.regs[usize::from(Control::ADDRESS)] = 0;
        self.set_irq(0x20);
    }
}

impl Interface for PiccSim {
    type Error = core::convert::Infallible;

    fn register_write(&mut self, addr: u8, buf: &[u8]) -> Result<(), Self::Error> {
        self.ops.borrow_mut().push(Op::Write(addr));
        for &b in buf {
            self.apply_write(addr, b);
        }
        Ok(())
    }

    fn register_read(&mut self, addr: u8, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.ops.borrow_mut().push(Op::Read(addr));
        for b in buf.iter_mut() {
            *b = self.read_one(addr);
        }
        Ok(())
    }
}
