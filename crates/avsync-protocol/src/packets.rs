use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::SYNC_MAGIC;

/// Timestamp in microseconds since UNIX epoch
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

// -- Message kinds --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MessageKind {
    Heartbeat = 0x01,
    SyncCue = 0x02,
    SeekCue = 0x03,
    PauseCue = 0x04,
    ResumeCue = 0x05,
    ClientDiscover = 0x06,
    ClientAnnounce = 0x07,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Heartbeat),
            0x02 => Some(Self::SyncCue),
            0x03 => Some(Self::SeekCue),
            0x04 => Some(Self::PauseCue),
            0x05 => Some(Self::ResumeCue),
            0x06 => Some(Self::ClientDiscover),
            0x07 => Some(Self::ClientAnnounce),
            _ => None,
        }
    }

    /// Cues ask a peer to act on its transport; the rest are bookkeeping.
    pub fn is_cue(self) -> bool {
        matches!(
            self,
            Self::SyncCue | Self::SeekCue | Self::PauseCue | Self::ResumeCue
        )
    }
}

// -- Sync Message (65 bytes) --
//
// Fixed layout, all integers big-endian:
//
//   magic(4) kind(1) sender_id(4) timestamp_us(8) frame_number(4)
//   seek_position(8, f64 bits) name(32, NUL padded) checksum(4)
//
// The checksum is the wrapping u32 sum of every byte before it. It guards
// against corruption on the wire, not against forgery.

/// Size of the fixed name field in bytes
pub const NAME_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncMessage {
    pub magic: u32,
    pub kind: MessageKind,
    pub sender_id: u32,
    pub timestamp_us: u64,
    pub frame_number: u32,
    pub seek_position: f64,
    pub name: [u8; NAME_LEN],
    pub checksum: u32,
}

impl SyncMessage {
    pub const SIZE: usize = 65;

    /// Offset of the checksum field; everything before it is summed.
    const CHECKSUM_OFFSET: usize = Self::SIZE - 4;

    fn new(kind: MessageKind, sender_id: u32, name: &str) -> Self {
        let mut msg = Self {
            magic: SYNC_MAGIC,
            kind,
            sender_id,
            timestamp_us: now_us(),
            frame_number: 0,
            seek_position: 0.0,
            name: encode_name(name),
            checksum: 0,
        };
        msg.update_checksum();
        msg
    }

    pub fn heartbeat(sender_id: u32, name: &str) -> Self {
        Self::new(MessageKind::Heartbeat, sender_id, name)
    }

    pub fn sync_cue(sender_id: u32, frame_number: u32, name: &str) -> Self {
        let mut msg = Self::new(MessageKind::SyncCue, sender_id, name);
        msg.frame_number = frame_number;
        msg.update_checksum();
        msg
    }

    pub fn seek_cue(sender_id: u32, position: f64, name: &str) -> Self {
        let mut msg = Self::new(MessageKind::SeekCue, sender_id, name);
        msg.seek_position = position;
        msg.update_checksum();
        msg
    }

    pub fn pause_cue(sender_id: u32, name: &str) -> Self {
        Self::new(MessageKind::PauseCue, sender_id, name)
    }

    pub fn resume_cue(sender_id: u32, name: &str) -> Self {
        Self::new(MessageKind::ResumeCue, sender_id, name)
    }

    pub fn client_discover(sender_id: u32, name: &str) -> Self {
        Self::new(MessageKind::ClientDiscover, sender_id, name)
    }

    pub fn client_announce(sender_id: u32, name: &str) -> Self {
        Self::new(MessageKind::ClientAnnounce, sender_id, name)
    }

    /// Display name carried in the message, up to the first NUL.
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Sum of all bytes preceding the checksum field, as encoded on the wire.
    pub fn compute_checksum(&self) -> u32 {
        let mut buf = [0u8; Self::SIZE];
        self.write_fields(&mut buf);
        additive_checksum(&buf[..Self::CHECKSUM_OFFSET])
    }

    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    pub fn validate_checksum(&self) -> bool {
        self.compute_checksum() == self.checksum
    }

    /// Magic matches and checksum holds.
    pub fn is_valid(&self) -> bool {
        self.magic == SYNC_MAGIC && self.validate_checksum()
    }

    fn write_fields(&self, buf: &mut [u8; Self::SIZE]) {
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.kind as u8;
        buf[5..9].copy_from_slice(&self.sender_id.to_be_bytes());
        buf[9..17].copy_from_slice(&self.timestamp_us.to_be_bytes());
        buf[17..21].copy_from_slice(&self.frame_number.to_be_bytes());
        buf[21..29].copy_from_slice(&self.seek_position.to_bits().to_be_bytes());
        buf[29..61].copy_from_slice(&self.name);
    }

    /// Encode as stored; the checksum field is written verbatim.
    pub fn serialize(&self, buf: &mut [u8; Self::SIZE]) {
        self.write_fields(buf);
        buf[61..65].copy_from_slice(&self.checksum.to_be_bytes());
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        self.serialize(&mut buf);
        buf
    }

    /// Parse a datagram. Rejects anything that is not exactly `SIZE` bytes,
    /// lacks the magic, or names an unknown kind. The checksum is parsed but
    /// not checked here; see `validate_checksum`.
    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() != Self::SIZE {
            return None;
        }

        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if magic != SYNC_MAGIC {
            return None;
        }

        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&data[29..61]);

        Some(Self {
            magic,
            kind: MessageKind::from_u8(data[4])?,
            sender_id: u32::from_be_bytes([data[5], data[6], data[7], data[8]]),
            timestamp_us: u64::from_be_bytes([
                data[9], data[10], data[11], data[12], data[13], data[14], data[15], data[16],
            ]),
            frame_number: u32::from_be_bytes([data[17], data[18], data[19], data[20]]),
            seek_position: f64::from_bits(u64::from_be_bytes([
                data[21], data[22], data[23], data[24], data[25], data[26], data[27], data[28],
            ])),
            name,
            checksum: u32::from_be_bytes([data[61], data[62], data[63], data[64]]),
        })
    }
}

fn additive_checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |sum, &b| sum.wrapping_add(b as u32))
}

/// Copy a display name into the fixed field. At most `NAME_LEN - 1` bytes are
/// kept, cut on a char boundary, so the field always ends in NUL.
fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let mut field = [0u8; NAME_LEN];
    let mut end = name.len().min(NAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].copy_from_slice(&name.as_bytes()[..end]);
    field
}
