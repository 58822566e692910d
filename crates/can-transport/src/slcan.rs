use crate::{
    dlc_for_len, len_for_dlc, BusInfo, CanBus, CanFrame, CanId, Result, TransportError,
    CLASSIC_MAX_PAYLOAD, FD_MAX_PAYLOAD,
};
use serialport::{SerialPort, SerialPortType};
use std::io::{Read, Write};
use std::time::Duration;

/// SLCAN text protocol over serial (common on macOS USB-CAN dongles).
///
/// Classic frames use `t`/`T`; FD frames use `d`/`D` (no bit-rate switch) and
/// `b`/`B` (bit-rate switch), with the DLC as one hex digit.
pub struct SlcanBus {
    _port_path: String,
    port: Box<dyn SerialPort>,
    fd: bool,
    pending: Vec<u8>,
}

impl SlcanBus {
    /// Open a classic CAN channel at `bitrate` (default 500k).
    pub fn open_with(path: &str, bitrate: Option<SlcanBitrate>) -> Result<Self> {
        Self::open_fd(path, bitrate, None)
    }

    /// Open a channel; a data bitrate enables CAN-FD frames.
    pub fn open_fd(
        path: &str,
        bitrate: Option<SlcanBitrate>,
        data_bitrate: Option<SlcanDataBitrate>,
    ) -> Result<Self> {
        let mut port = serialport::new(path, 115200)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(|e| TransportError::Io(e.to_string()))?;
        // Close, configure, then open
        let _ = Self::write_cmd(&mut *port, b"C\r");
        let code = bitrate.unwrap_or(SlcanBitrate::B500k).code();
        Self::write_cmd(&mut *port, &[b'S', code, b'\r'])?;
        if let Some(db) = data_bitrate {
            Self::write_cmd(&mut *port, &[b'Y', db.code(), b'\r'])?;
        }
        Self::write_cmd(&mut *port, b"O\r")?;
        tracing::debug!(path, fd = data_bitrate.is_some(), "slcan channel open");
        Ok(SlcanBus {
            _port_path: path.to_string(),
            port,
            fd: data_bitrate.is_some(),
            pending: Vec::with_capacity(160),
        })
    }

    fn encode_frame(frame: &CanFrame) -> Result<Vec<u8>> {
        if frame.rtr {
            return Err(TransportError::Unsupported("RTR not implemented"));
        }
        let len = usize::from(frame.len);
        let (kind, dlc) = if frame.fd {
            let dlc = dlc_for_len(len).ok_or(TransportError::InvalidFrame("fd length"))?;
            let kind = match (frame.id.is_extended(), frame.brs) {
                (false, false) => b'd',
                (true, false) => b'D',
                (false, true) => b'b',
                (true, true) => b'B',
            };
            (kind, dlc)
        } else {
            if len > CLASSIC_MAX_PAYLOAD {
                return Err(TransportError::InvalidFrame("dlc > 8"));
            }
            let kind = if frame.id.is_extended() { b'T' } else { b't' };
            (kind, frame.len)
        };

        let mut out = Vec::with_capacity(2 + 8 + 1 + 2 * len);
        out.push(kind);
        let id = if frame.id.is_extended() {
            format!("{:08X}", frame.id.raw())
        } else {
            format!("{:03X}", frame.id.raw())
        };
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(format!("{dlc:X}").as_bytes());
        for b in frame.payload() {
            out.extend_from_slice(format!("{b:02X}").as_bytes());
        }
        out.push(b'\r');
        Ok(out)
    }

    fn parse_frame(line: &[u8]) -> Result<CanFrame> {
        let kind = *line.first().ok_or(TransportError::InvalidFrame("empty"))?;
        let (extended, fd, brs, rtr) = match kind {
            b't' => (false, false, false, false),
            b'r' => (false, false, false, true),
            b'T' => (true, false, false, false),
            b'R' => (true, false, false, true),
            b'd' => (false, true, false, false),
            b'D' => (true, true, false, false),
            b'b' => (false, true, true, false),
            b'B' => (true, true, true, false),
            _ => return Err(TransportError::InvalidFrame("unknown header")),
        };
        let id_len = if extended { 8 } else { 3 };
        if line.len() < 1 + id_len + 1 {
            return Err(TransportError::InvalidFrame("short header"));
        }
        let raw_id = u32::from_str_radix(hex_str(&line[1..1 + id_len])?, 16)
            .map_err(|_| TransportError::InvalidFrame("id"))?;
        let id = if extended {
            CanId::extended(raw_id)
        } else {
            u16::try_from(raw_id).ok().and_then(CanId::standard)
        }
        .ok_or(TransportError::InvalidFrame("id range"))?;

        let dlc = u8::from_str_radix(hex_str(&line[1 + id_len..2 + id_len])?, 16)
            .map_err(|_| TransportError::InvalidFrame("dlc"))?;
        let len = if fd {
            len_for_dlc(dlc).ok_or(TransportError::InvalidFrame("dlc"))?
        } else {
            usize::from(dlc).min(CLASSIC_MAX_PAYLOAD)
        };

        let mut data = [0u8; FD_MAX_PAYLOAD];
        if !rtr {
            let hex = &line[2 + id_len..];
            if hex.len() < 2 * len {
                return Err(TransportError::InvalidFrame("short data"));
            }
            for (i, slot) in data.iter_mut().take(len).enumerate() {
                *slot = u8::from_str_radix(hex_str(&hex[2 * i..2 * i + 2])?, 16)
                    .map_err(|_| TransportError::InvalidFrame("byte"))?;
            }
        }
        let mut frame = CanFrame {
            id,
            len: len as u8,
            data,
            rtr,
            fd,
            brs,
            timestamp: None,
        };
        frame.stamp_now();
        Ok(frame)
    }

    fn write_cmd(port: &mut dyn SerialPort, cmd: &[u8]) -> Result<()> {
        port.write_all(cmd)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }
}

fn hex_str(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| TransportError::InvalidFrame("utf8"))
}

impl CanBus for SlcanBus {
    fn open(path: &str) -> Result<Self>
    where
        Self: Sized,
    {
        // Default to 500k to keep prior behavior
        Self::open_with(path, Some(SlcanBitrate::B500k))
    }

    fn list() -> Result<Vec<BusInfo>> {
        let mut out = Vec::new();
        for p in serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))? {
            let driver = match p.port_type {
                SerialPortType::UsbPort(_) => "slcan-serial",
                // Still include other serial ports; user can pick
                _ => "serial",
            };
            out.push(BusInfo {
                name: p.port_name,
                driver: driver.to_string(),
            });
        }
        Ok(out)
    }

    fn max_payload(&self) -> usize {
        if self.fd {
            FD_MAX_PAYLOAD
        } else {
            CLASSIC_MAX_PAYLOAD
        }
    }

    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        if let Some(ms) = timeout_ms {
            self.port.set_timeout(Duration::from_millis(ms)).ok();
        }
        let mut buf = [0u8; 256];
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\r') {
                let line: Vec<u8> = self.pending.drain(..=pos).collect();
                // Drop terminator; bare CR acknowledges a command
                let trim = &line[..line.len().saturating_sub(1)];
                if trim.is_empty() {
                    continue;
                }
                return Self::parse_frame(trim);
            }
            match self.port.read(&mut buf) {
                Ok(n) if n > 0 => self.pending.extend_from_slice(&buf[..n]),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout)
                }
                Err(e) => return Err(TransportError::Io(e.to_string())),
            }
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        if frame.fd && !self.fd {
            return Err(TransportError::FrameTooLarge {
                len: usize::from(frame.len),
                max: CLASSIC_MAX_PAYLOAD,
            });
        }
        let line = Self::encode_frame(frame)?;
        self.port
            .write_all(&line)
            .map_err(|e| TransportError::Io(e.to_string()))?;
        Ok(())
    }
}

/// Supported SLCAN bitrates (mapped to Sx codes)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlcanBitrate {
    B10k,  // S0
    B20k,  // S1
    B50k,  // S2
    B100k, // S3
    B125k, // S4
    B250k, // S5
    B500k, // S6
    B800k, // S7
    B1M,   // S8
}

impl SlcanBitrate {
    pub fn code(self) -> u8 {
        match self {
            SlcanBitrate::B10k => b'0',
            SlcanBitrate::B20k => b'1',
            SlcanBitrate::B50k => b'2',
            SlcanBitrate::B100k => b'3',
            SlcanBitrate::B125k => b'4',
            SlcanBitrate::B250k => b'5',
            SlcanBitrate::B500k => b'6',
            SlcanBitrate::B800k => b'7',
            SlcanBitrate::B1M => b'8',
        }
    }
}

/// CAN-FD data phase bitrates (mapped to Yx codes)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SlcanDataBitrate {
    M2, // Y2
    M5, // Y5
}

impl SlcanDataBitrate {
    pub fn code(self) -> u8 {
        match self {
            SlcanDataBitrate::M2 => b'2',
            SlcanDataBitrate::M5 => b'5',
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_frame_text_round_trip() {
        let id = CanId::standard(0x123).unwrap();
        let frame = CanFrame::new(id, &[0xDE, 0xAD]).unwrap();
        let line = SlcanBus::encode_frame(&frame).unwrap();
        assert_eq!(line, b"t1232DEAD\r");
        let parsed = SlcanBus::parse_frame(&line[..line.len() - 1]).unwrap();
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.payload(), &[0xDE, 0xAD]);
        assert!(!parsed.fd);
    }

    #[test]
    fn fd_frame_uses_hex_dlc() {
        let id = CanId::extended(0x8001).unwrap();
        let frame = CanFrame::new_fd(id, &[0x50; 12]).unwrap();
        let line = SlcanBus::encode_frame(&frame).unwrap();
        assert_eq!(&line[..10], b"B000080019");
        let parsed = SlcanBus::parse_frame(&line[..line.len() - 1]).unwrap();
        assert!(parsed.fd && parsed.brs);
        assert_eq!(parsed.payload(), &[0x50; 12]);
    }

    #[test]
    fn rejects_truncated_data() {
        assert!(matches!(
            SlcanBus::parse_frame(b"t1232DE"),
            Err(TransportError::InvalidFrame("short data"))
        ));
        assert!(SlcanBus::parse_frame(b"x").is_err());
    }
}
