use core::fmt;
use serde::{Deserialize, Serialize};

/// Address of a controller-exposed register.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterAddress(pub u32);

impl RegisterAddress {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// The address directly after this one, if it exists.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl From<u32> for RegisterAddress {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03x}", self.0)
    }
}

/// Bus identity of one controller (7 bits).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ControllerId(u8);

impl ControllerId {
    pub const MAX: u8 = 0x7F;

    pub fn new(id: u8) -> Option<Self> {
        (id <= Self::MAX).then_some(Self(id))
    }

    pub fn raw(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Integer width of a fixed-point register.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum IntWidth {
    W8,
    W16,
    W32,
}

impl IntWidth {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(Self::W8),
            16 => Some(Self::W16),
            32 => Some(Self::W32),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::W8 => 8,
            Self::W16 => 16,
            Self::W32 => 32,
        }
    }
}

/// Numeric type tag carried in sub-frame headers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WireType {
    Int8,
    Int16,
    Int32,
    Float32,
}

impl WireType {
    /// Two-bit code used in sub-frame headers.
    pub fn code(self) -> u8 {
        match self {
            Self::Int8 => 0,
            Self::Int16 => 1,
            Self::Int32 => 2,
            Self::Float32 => 3,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code & 0x03 {
            0 => Self::Int8,
            1 => Self::Int16,
            2 => Self::Int32,
            _ => Self::Float32,
        }
    }

    /// Bytes per value on the wire.
    pub fn size(self) -> usize {
        match self {
            Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int32 | Self::Float32 => 4,
        }
    }

    fn for_width(width: IntWidth) -> Self {
        match width {
            IntWidth::W8 => Self::Int8,
            IntWidth::W16 => Self::Int16,
            IntWidth::W32 => Self::Int32,
        }
    }
}

/// How one register's value is represented on the wire.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Resolution {
    Int8,
    Int16,
    Int32,
    UInt8,
    UInt16,
    UInt32,
    Float32,
    /// Signed integer of `width` bits; the logical value is `raw * scale`.
    FixedPoint { width: IntWidth, scale: f64 },
}

impl Resolution {
    /// Fixed-point resolution; `None` for unsupported widths or a zero/non-finite scale.
    pub fn fixed(bits: u8, scale: f64) -> Option<Self> {
        let width = IntWidth::from_bits(bits)?;
        let res = Self::FixedPoint { width, scale };
        res.is_valid().then_some(res)
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Self::FixedPoint { scale, .. } => scale.is_finite() && *scale != 0.0,
            _ => true,
        }
    }

    /// Width class this resolution travels as.
    pub fn wire_type(&self) -> WireType {
        match self {
            Self::Int8 | Self::UInt8 => WireType::Int8,
            Self::Int16 | Self::UInt16 => WireType::Int16,
            Self::Int32 | Self::UInt32 => WireType::Int32,
            Self::Float32 => WireType::Float32,
            Self::FixedPoint { width, .. } => WireType::for_width(*width),
        }
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self, Self::UInt8 | Self::UInt16 | Self::UInt32)
    }

    fn scale(&self) -> Option<f64> {
        match self {
            Self::FixedPoint { scale, .. } => Some(*scale),
            _ => None,
        }
    }

    /// Decode one value that arrived as `wire`.
    ///
    /// The wire type fixes the byte width; the resolution fixes signedness and
    /// scaling. Float values are taken as-is. Returns `None` when `bytes` does not
    /// hold exactly one value.
    pub fn decode(&self, wire: WireType, bytes: &[u8]) -> Option<f64> {
        let unsigned = self.is_unsigned();
        let raw = match wire {
            WireType::Int8 => {
                let [b] = <[u8; 1]>::try_from(bytes).ok()?;
                if unsigned {
                    f64::from(b)
                } else {
                    f64::from(b as i8)
                }
            }
            WireType::Int16 => {
                let b = <[u8; 2]>::try_from(bytes).ok()?;
                if unsigned {
                    f64::from(u16::from_le_bytes(b))
                } else {
                    f64::from(i16::from_le_bytes(b))
                }
            }
            WireType::Int32 => {
                let b = <[u8; 4]>::try_from(bytes).ok()?;
                if unsigned {
                    f64::from(u32::from_le_bytes(b))
                } else {
                    f64::from(i32::from_le_bytes(b))
                }
            }
            WireType::Float32 => {
                let b = <[u8; 4]>::try_from(bytes).ok()?;
                return Some(f64::from(f32::from_le_bytes(b)));
            }
        };
        Some(match self.scale() {
            Some(scale) => raw * scale,
            None => raw,
        })
    }

    /// Encode `value` in this resolution's own wire type.
    pub fn encode_value(&self, value: f64) -> Vec<u8> {
        self.encode_as(self.wire_type(), value)
    }

    /// Encode `value` as `wire`, saturating to the representable range.
    pub fn encode_as(&self, wire: WireType, value: f64) -> Vec<u8> {
        if wire == WireType::Float32 {
            return (value as f32).to_le_bytes().to_vec();
        }
        let raw = match self.scale() {
            Some(scale) => (value / scale).round(),
            None => value.round(),
        };
        // `as` casts from f64 saturate and map NaN to zero.
        match (wire, self.is_unsigned()) {
            (WireType::Int8, false) => (raw as i8).to_le_bytes().to_vec(),
            (WireType::Int8, true) => (raw as u8).to_le_bytes().to_vec(),
            (WireType::Int16, false) => (raw as i16).to_le_bytes().to_vec(),
            (WireType::Int16, true) => (raw as u16).to_le_bytes().to_vec(),
            (WireType::Int32, false) => (raw as i32).to_le_bytes().to_vec(),
            (WireType::Int32, true) => (raw as u32).to_le_bytes().to_vec(),
            (WireType::Float32, _) => (value as f32).to_le_bytes().to_vec(),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int8 => f.write_str("int8"),
            Self::Int16 => f.write_str("int16"),
            Self::Int32 => f.write_str("int32"),
            Self::UInt8 => f.write_str("uint8"),
            Self::UInt16 => f.write_str("uint16"),
            Self::UInt32 => f.write_str("uint32"),
            Self::Float32 => f.write_str("float32"),
            Self::FixedPoint { width, scale } => write!(f, "fixed{}*{scale}", width.bits()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(res: Resolution, value: f64) -> f64 {
        let bytes = res.encode_value(value);
        assert_eq!(bytes.len(), res.wire_type().size());
        res.decode(res.wire_type(), &bytes).unwrap()
    }

    #[test]
    fn integer_boundaries_survive_round_trip() {
        for v in [0.0, 1.0, -1.0, 127.0, -128.0] {
            assert_eq!(round_trip(Resolution::Int8, v), v);
        }
        for v in [0.0, 32767.0, -32768.0, -559.0] {
            assert_eq!(round_trip(Resolution::Int16, v), v);
        }
        for v in [2_147_483_647.0, -2_147_483_648.0] {
            assert_eq!(round_trip(Resolution::Int32, v), v);
        }
        assert_eq!(round_trip(Resolution::UInt8, 255.0), 255.0);
        assert_eq!(round_trip(Resolution::UInt16, 65535.0), 65535.0);
        assert_eq!(round_trip(Resolution::UInt32, 4_294_967_295.0), 4_294_967_295.0);
    }

    #[test]
    fn float_edges_survive_round_trip() {
        for v in [0.0, -0.25, 1.5, f64::from(f32::MAX), f64::from(f32::MIN_POSITIVE)] {
            assert_eq!(round_trip(Resolution::Float32, v), v);
        }
        let inf = round_trip(Resolution::Float32, f64::INFINITY);
        assert!(inf.is_infinite() && inf > 0.0);
    }

    #[test]
    fn signed_reads_sign_extend() {
        let bytes = 64977u16.to_le_bytes();
        assert_eq!(Resolution::Int16.decode(WireType::Int16, &bytes), Some(-559.0));
        assert_eq!(Resolution::UInt16.decode(WireType::Int16, &bytes), Some(64977.0));
        assert_eq!(Resolution::Int8.decode(WireType::Int8, &[0xFF]), Some(-1.0));
        assert_eq!(Resolution::UInt8.decode(WireType::Int8, &[0xFF]), Some(255.0));
    }

    #[test]
    fn fixed_point_scales_signed_raw() {
        let half = Resolution::fixed(32, 1.0 / 65536.0).unwrap();
        let bytes = 32768i32.to_le_bytes();
        assert_eq!(half.decode(WireType::Int32, &bytes), Some(0.5));

        let rev16 = Resolution::fixed(16, 1.0 / 65536.0).unwrap();
        assert_eq!(rev16.decode(WireType::Int16, &0x8000u16.to_le_bytes()), Some(-0.5));
        assert_eq!(rev16.decode(WireType::Int16, &0x4000u16.to_le_bytes()), Some(0.25));
    }

    #[test]
    fn fixed_point_round_trip_quantizes() {
        let volts = Resolution::fixed(8, 0.5).unwrap();
        assert_eq!(round_trip(volts, 24.0), 24.0);
        assert_eq!(round_trip(volts, 24.3), 24.5);
        // saturates at the signed range
        assert_eq!(round_trip(volts, 1000.0), 63.5);
    }

    #[test]
    fn invalid_fixed_point_is_rejected() {
        assert!(Resolution::fixed(12, 1.0).is_none());
        assert!(Resolution::fixed(16, 0.0).is_none());
        assert!(Resolution::fixed(16, f64::NAN).is_none());
    }

    #[test]
    fn short_input_does_not_decode() {
        assert_eq!(Resolution::Int16.decode(WireType::Int16, &[0x01]), None);
        assert_eq!(Resolution::Float32.decode(WireType::Float32, &[0, 0, 0]), None);
    }

    #[test]
    fn controller_id_is_seven_bits() {
        assert!(ControllerId::new(0x7F).is_some());
        assert!(ControllerId::new(0x80).is_none());
    }
}
