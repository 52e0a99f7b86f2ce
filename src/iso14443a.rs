use embedded_hal::delay::DelayNs;

use crate::registers::{Coll, ModWidth, Register, RxMode, TxMode};
use crate::{Error, Interface, Mfrc522, Result};

/// Reserved byte marking "UID continues at the next cascade level"
pub const CASCADE_TAG: u8 = 0x88;
/// SAK bit set while the UID is not complete yet
pub const SAK_CASCADE_BIT: u8 = 0x04;

/// Commands addressed to the tag, ISO 14443-3 section 6.4
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
#[repr(u8)]
pub enum PiccCommand {
    /// Request type A, 7-bit short frame
    ReqA = 0x26,
    /// Wake-up type A, also brings halted tags back
    WupA = 0x52,
    SelCl1 = 0x93,
    SelCl2 = 0x95,
    SelCl3 = 0x97,
}

pub enum ShortFrame {
    ReqA,
    WupA,
}

/// One round of the UID-selection protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum CascadeLevel {
    One,
    Two,
    Three,
}

impl CascadeLevel {
    fn command(self) -> PiccCommand {
        match self {
            CascadeLevel::One => PiccCommand::SelCl1,
            CascadeLevel::Two => PiccCommand::SelCl2,
            CascadeLevel::Three => PiccCommand::SelCl3,
        }
    }

    /// There is no level four; a tag asking for one is broken
    fn next(self) -> Option<Self> {
        match self {
            CascadeLevel::One => Some(CascadeLevel::Two),
            CascadeLevel::Two => Some(CascadeLevel::Three),
            CascadeLevel::Three => None,
        }
    }
}

/// Exclusive-or checksum over a 4-byte UID chunk
pub fn bcc(chunk: &[u8; 4]) -> u8 {
    chunk.iter().fold(0, |acc, b| acc ^ b)
}

/// Decodes the collision register.
///
/// `None` when the chip could not pin the collision down; otherwise the
/// 1-based bit position within the anticollision reply, where the raw
/// value 0 stands for bit 32.
pub fn collision_bit_position(coll: Coll) -> Option<u8> {
    if coll.position_not_valid() {
        return None;
    }
    Some(match coll.position().value() {
        0 => 32,
        pos => pos,
    })
}

/// The 9-byte SELECT/ANTICOLLISION frame.
///
/// Layout: SEL, NVB, four UID bytes (the first possibly a Cascade Tag),
/// BCC, CRC_A. BCC and CRC_A are only transmitted once every UID bit of
/// the level is known.
pub struct SelectFrame {
    buf: [u8; 9],
}

impl SelectFrame {
    pub fn new(level: CascadeLevel) -> Self {
        let mut buf = [0; 9];
        buf[0] = level.command() as u8;
        Self { buf }
    }

    pub fn as_bytes(&self) -> &[u8; 9] {
        &self.buf
    }

    /// NVB for a partially known UID.
    ///
    /// Counts the whole command: high nibble full bytes including SEL and
    /// NVB themselves, low nibble the extra bits.
    pub fn set_known_bits(&mut self, uid_bits: u8) {
        let bytes = 2 + uid_bits / 8;
        let bits = uid_bits % 8;
        self.buf[1] = (bytes << 4) | bits;
    }

    /// NVB announcing a full 7-byte select frame
    pub fn set_complete(&mut self) {
        self.buf[1] = 0x70;
    }

    pub fn nvb(&self) -> u8 {
        self.buf[1]
    }

    pub fn uid_chunk(&self) -> [u8; 4] {
        [self.buf[2], self.buf[3], self.buf[4], self.buf[5]]
    }

    pub fn apply_bcc(&mut self) {
        self.buf[6] = bcc(&self.uid_chunk());
    }

    pub fn set_crc(&mut self, crc: [u8; 2]) {
        self.buf[7] = crc[0];
        self.buf[8] = crc[1];
    }

    /// Forces UID bit `pos` (1-based) to 1, the tie-break after a
    /// collision: tags carrying 0 at that position drop out.
    pub fn force_uid_bit(&mut self, pos: u8) {
        let index = 2 + usize::from((pos - 1) / 8);
        self.buf[index] |= 1 << ((pos - 1) % 8);
    }
}

/// A UID of 4, 7 or 10 bytes assembled across cascade levels
#[derive(Debug, Clone, Default, PartialEq, Eq, defmt::Format)]
pub struct Uid {
    bytes: heapless::Vec<u8, 10>,
}

impl Uid {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn append(&mut self, chunk: &[u8]) -> core::result::Result<(), ()> {
        self.bytes.extend_from_slice(chunk)
    }
}

/// ISO 14443A poller built on top of the device driver
pub struct Iso14443aInitiator<I, D>(Mfrc522<I, D>);

impl<I: Interface, D: DelayNs> Iso14443aInitiator<I, D> {
    pub(crate) fn new(drv: Mfrc522<I, D>) -> Self {
        Self(drv)
    }

    /// Gives the device driver back
    pub fn release(self) -> Mfrc522<I, D> {
        self.0
    }

    /// Probes for a tag in the field with a REQA.
    ///
    /// A collision counts as presence, it means more than one tag
    /// answered. Bus faults propagate; every other failure is "no card".
    pub fn detect_presence(&mut self) -> Result<bool, I> {
        self.reset_speed()?;
        let mut atqa = [0u8; 2];
        match self.transceive_short_frame(ShortFrame::ReqA, &mut atqa) {
            Ok(()) => Ok(true),
            Err(Error::Collision) => Ok(true),
            Err(Error::Interface(e)) => Err(Error::Interface(e)),
            Err(_) => Ok(false),
        }
    }

    /// Resets data rate and modulation width to the 106 kBd defaults a
    /// fresh tag expects
    fn reset_speed(&mut self) -> Result<(), I> {
        TxMode::default()
            .write(&mut self.0.iface)
            .map_err(Error::Interface)?;
        RxMode::default()
            .write(&mut self.0.iface)
            .map_err(Error::Interface)?;
        ModWidth::new(0x26)
            .write(&mut self.0.iface)
            .map_err(Error::Interface)
    }

    /// Sends a REQA or WUPA short frame and reads back the 2-byte ATQA
    pub fn transceive_short_frame(
        &mut self,
        frame: ShortFrame,
        atqa: &mut [u8; 2],
    ) -> Result<(), I> {
        // keep the bits received after a collision
        Coll::modify(&mut self.0.iface, |r| r.set_values_after_coll(false))
            .map_err(Error::Interface)?;
        let cmd = [match frame {
            ShortFrame::ReqA => PiccCommand::ReqA,
            ShortFrame::WupA => PiccCommand::WupA,
        } as u8];
        // short frame format: only 7 bits of the single byte go out
        let (n, last_bits) = self.0.transceive(&cmd, 7, 0, Some(atqa))?;
        if n != 2 || last_bits != 0 {
            return Err(Error::Internal);
        }
        Ok(())
    }

    /// Runs anticollision and selection until the complete UID is known.
    ///
    /// Walks up to three cascade levels; each level resolves its 4-byte
    /// chunk bit by bit under collisions, then confirms it with a Select
    /// exchange. The SAK's cascade bit decides whether another level
    /// follows, and Cascade Tag bytes are stripped while assembling, so
    /// the final length of 4, 7 or 10 bytes falls out of the tag pattern
    /// itself.
    pub fn select(&mut self) -> Result<Uid, I> {
        Coll::modify(&mut self.0.iface, |r| r.set_values_after_coll(false))
            .map_err(Error::Interface)?;

        let mut uid = Uid::default();
        let mut level = CascadeLevel::One;
        loop {
            let (chunk, sak) = self.select_level(level)?;
            if sak & SAK_CASCADE_BIT != 0 {
                // a continued chunk must open with the Cascade Tag
                if chunk[0] != CASCADE_TAG {
                    return Err(Error::Internal);
                }
                uid.append(&chunk[1..]).map_err(|()| Error::Internal)?;
                level = level.next().ok_or(Error::Internal)?;
            } else {
                uid.append(&chunk).map_err(|()| Error::Internal)?;
                defmt::debug!("Selected tag, uid {=[u8]:X}", uid.as_bytes());
                return Ok(uid);
            }
        }
    }

    /// One cascade level: anticollision until all 32 chunk bits are known,
    /// then the confirming Select exchange. Returns the chunk and the SAK.
    fn select_level(&mut self, level: CascadeLevel) -> Result<([u8; 4], u8), I> {
        let mut frame = SelectFrame::new(level);
        let mut known_bits: u8 = 0;

        while known_bits < 32 {
            frame.set_known_bits(known_bits);
            let tx_last_bits = known_bits % 8;
            // first buffer slot that still receives bits; with a partial
            // byte it is both transmitted and completed in place
            let index = 2 + usize::from(known_bits / 8);
            let tx_len = index + usize::from(tx_last_bits != 0);
            let mut tx = [0u8; 9];
            tx[..tx_len].copy_from_slice(&frame.buf[..tx_len]);

            let res = self.0.transceive(
                &tx[..tx_len],
                tx_last_bits,
                tx_last_bits,
                Some(&mut frame.buf[index..7]),
            );
            match res {
                Ok(_) => known_bits = 32,
                Err(Error::Collision) => {
                    let coll = Coll::read(&mut self.0.iface).map_err(Error::Interface)?;
                    // an unlocatable collision cannot be resolved
                    let pos = collision_bit_position(coll).ok_or(Error::Collision)?;
                    // each round must pin down at least one new bit; a tag
                    // reporting otherwise would spin this loop forever
                    if pos <= known_bits {
                        return Err(Error::Internal);
                    }
                    frame.force_uid_bit(pos);
                    known_bits = pos;
                }
                Err(e) => return Err(e),
            }
        }

        frame.set_complete();
        frame.apply_bcc();
        let crc = self.0.calculate_crc(&frame.buf[..7])?;
        frame.set_crc(crc);

        let mut rx = [0u8; 3];
        let (n, last_bits) = self.0.transceive(&frame.buf, 0, 0, Some(&mut rx))?;
        // expect exactly SAK plus its CRC_A, byte aligned
        if n != 3 || last_bits != 0 {
            return Err(Error::Internal);
        }
        let expect = self.0.calculate_crc(&rx[..1])?;
        if expect != [rx[1], rx[2]] {
            return Err(Error::BadCrc);
        }
        Ok((frame.uid_chunk(), rx[0]))
    }
}
