use core::fmt;
use time::OffsetDateTime;

/// Largest payload of a classic CAN data frame.
pub const CLASSIC_MAX_PAYLOAD: usize = 8;

/// Largest payload of a CAN-FD data frame.
pub const FD_MAX_PAYLOAD: usize = 64;

/// Payload lengths addressable by the 4-bit DLC of a CAN-FD frame.
const FD_LENGTHS: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

/// 11-bit or 29-bit CAN identifier
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    pub fn standard(id11: u16) -> Option<Self> {
        if id11 <= 0x7FF {
            Some(Self {
                raw: id11 as u32,
                extended: false,
            })
        } else {
            None
        }
    }

    pub fn extended(id29: u32) -> Option<Self> {
        if id29 <= 0x1FFF_FFFF {
            Some(Self {
                raw: id29,
                extended: true,
            })
        } else {
            None
        }
    }

    pub fn raw(&self) -> u32 {
        self.raw
    }
    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "0x{raw:08X}", raw = self.raw)
        } else {
            write!(f, "0x{raw:03X}", raw = self.raw)
        }
    }
}

/// A CAN data frame, classic (up to 8 bytes) or FD (up to 64 bytes).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanFrame {
    pub id: CanId,
    pub len: u8,
    pub data: [u8; FD_MAX_PAYLOAD],
    pub rtr: bool,
    /// Frame uses the CAN-FD format.
    pub fd: bool,
    /// Bit-rate switch for the FD data phase.
    pub brs: bool,
    pub timestamp: Option<Timestamp>,
}

impl CanFrame {
    /// Classic data frame; `None` if `data` is longer than 8 bytes.
    pub fn new(id: CanId, data: &[u8]) -> Option<Self> {
        if data.len() > CLASSIC_MAX_PAYLOAD {
            return None;
        }
        Some(Self::with_payload(id, data, false))
    }

    /// FD data frame; `data.len()` must be one of the lengths a DLC can express.
    pub fn new_fd(id: CanId, data: &[u8]) -> Option<Self> {
        dlc_for_len(data.len())?;
        let mut frame = Self::with_payload(id, data, true);
        frame.brs = true;
        Some(frame)
    }

    fn with_payload(id: CanId, data: &[u8], fd: bool) -> Self {
        let mut buf = [0u8; FD_MAX_PAYLOAD];
        buf[..data.len()].copy_from_slice(data);
        Self {
            id,
            len: data.len() as u8,
            data: buf,
            rtr: false,
            fd,
            brs: false,
            timestamp: None,
        }
    }

    /// The valid part of the payload.
    pub fn payload(&self) -> &[u8] {
        let len = usize::from(self.len).min(FD_MAX_PAYLOAD);
        &self.data[..len]
    }

    /// Stamp the frame with the current wall-clock time.
    pub fn stamp_now(&mut self) {
        self.timestamp = Some(Timestamp(OffsetDateTime::now_utc()));
    }
}

/// Smallest valid FD payload length that holds `len` bytes.
pub fn fd_padded_len(len: usize) -> Option<usize> {
    FD_LENGTHS.iter().copied().find(|&l| l >= len)
}

/// DLC code for an exact payload length, if one exists.
pub fn dlc_for_len(len: usize) -> Option<u8> {
    FD_LENGTHS.iter().position(|&l| l == len).map(|p| p as u8)
}

/// Payload length encoded by a DLC code (0..=15).
pub fn len_for_dlc(dlc: u8) -> Option<usize> {
    FD_LENGTHS.get(usize::from(dlc)).copied()
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Timestamp(pub OffsetDateTime);

#[derive(Clone, Debug)]
pub struct BusInfo {
    pub name: String,
    pub driver: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_frame_rejects_long_payload() {
        let id = CanId::standard(0x123).unwrap();
        assert!(CanFrame::new(id, &[0u8; 8]).is_some());
        assert!(CanFrame::new(id, &[0u8; 9]).is_none());
    }

    #[test]
    fn fd_frame_requires_dlc_length() {
        let id = CanId::extended(0x8001).unwrap();
        let frame = CanFrame::new_fd(id, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]).unwrap();
        assert!(frame.fd);
        assert_eq!(frame.payload().len(), 12);
        assert!(CanFrame::new_fd(id, &[0u8; 9]).is_none());
    }

    #[test]
    fn fd_padding_rounds_up() {
        assert_eq!(fd_padded_len(0), Some(0));
        assert_eq!(fd_padded_len(8), Some(8));
        assert_eq!(fd_padded_len(9), Some(12));
        assert_eq!(fd_padded_len(33), Some(48));
        assert_eq!(fd_padded_len(65), None);
    }

    #[test]
    fn dlc_table_is_symmetric() {
        for dlc in 0u8..16 {
            let len = len_for_dlc(dlc).unwrap();
            assert_eq!(dlc_for_len(len), Some(dlc));
        }
        assert_eq!(len_for_dlc(16), None);
    }
}
