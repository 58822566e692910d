use crate::{QueryError, RegisterAddress, Resolution, Result};
use std::collections::BTreeMap;

/// Well-known controller registers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Register {
    Mode,
    Position,
    Velocity,
    Torque,
    QCurrent,
    DCurrent,
    AbsPosition,
    Power,
    MotorTemperature,
    TrajectoryComplete,
    HomeState,
    Voltage,
    Temperature,
    Fault,
    Encoder0Position,
    Encoder0Velocity,
    Encoder1Position,
    Encoder1Velocity,
    Encoder2Position,
    Encoder2Velocity,
    EncoderValidity,
    MillisecondCounter,
    ImuAccelX,
    ImuAccelY,
    ImuAccelZ,
    ImuGyroX,
    ImuGyroY,
    ImuGyroZ,
}

/// Registers read when the caller adds nothing else.
pub const DEFAULT_QUERY: [Register; 7] = [
    Register::Mode,
    Register::Position,
    Register::Velocity,
    Register::Torque,
    Register::Voltage,
    Register::Temperature,
    Register::Fault,
];

impl Register {
    pub const ALL: [Register; 28] = [
        Register::Mode,
        Register::Position,
        Register::Velocity,
        Register::Torque,
        Register::QCurrent,
        Register::DCurrent,
        Register::AbsPosition,
        Register::Power,
        Register::MotorTemperature,
        Register::TrajectoryComplete,
        Register::HomeState,
        Register::Voltage,
        Register::Temperature,
        Register::Fault,
        Register::Encoder0Position,
        Register::Encoder0Velocity,
        Register::Encoder1Position,
        Register::Encoder1Velocity,
        Register::Encoder2Position,
        Register::Encoder2Velocity,
        Register::EncoderValidity,
        Register::MillisecondCounter,
        Register::ImuAccelX,
        Register::ImuAccelY,
        Register::ImuAccelZ,
        Register::ImuGyroX,
        Register::ImuGyroY,
        Register::ImuGyroZ,
    ];

    pub fn address(self) -> RegisterAddress {
        let raw = match self {
            Register::Mode => 0x000,
            Register::Position => 0x001,
            Register::Velocity => 0x002,
            Register::Torque => 0x003,
            Register::QCurrent => 0x004,
            Register::DCurrent => 0x005,
            Register::AbsPosition => 0x006,
            Register::Power => 0x007,
            Register::MotorTemperature => 0x00a,
            Register::TrajectoryComplete => 0x00b,
            Register::HomeState => 0x00c,
            Register::Voltage => 0x00d,
            Register::Temperature => 0x00e,
            Register::Fault => 0x00f,
            Register::Encoder0Position => 0x050,
            Register::Encoder0Velocity => 0x051,
            Register::Encoder1Position => 0x052,
            Register::Encoder1Velocity => 0x053,
            Register::Encoder2Position => 0x054,
            Register::Encoder2Velocity => 0x055,
            Register::EncoderValidity => 0x058,
            Register::MillisecondCounter => 0x070,
            Register::ImuAccelX => 0x072,
            Register::ImuAccelY => 0x073,
            Register::ImuAccelZ => 0x074,
            Register::ImuGyroX => 0x080,
            Register::ImuGyroY => 0x081,
            Register::ImuGyroZ => 0x082,
        };
        RegisterAddress(raw)
    }

    /// Built-in resolution. Positions are revolutions, velocities revolutions/s.
    pub fn resolution(self) -> Resolution {
        match self {
            Register::Mode
            | Register::TrajectoryComplete
            | Register::HomeState
            | Register::Fault
            | Register::EncoderValidity => Resolution::UInt8,
            Register::Voltage => Resolution::FixedPoint {
                width: crate::IntWidth::W8,
                scale: 0.5,
            },
            Register::Temperature => Resolution::FixedPoint {
                width: crate::IntWidth::W8,
                scale: 1.0,
            },
            Register::MillisecondCounter => Resolution::UInt32,
            Register::ImuAccelX
            | Register::ImuAccelY
            | Register::ImuAccelZ
            | Register::ImuGyroX
            | Register::ImuGyroY
            | Register::ImuGyroZ => Resolution::Int16,
            _ => Resolution::Float32,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Register::Mode => "mode",
            Register::Position => "position",
            Register::Velocity => "velocity",
            Register::Torque => "torque",
            Register::QCurrent => "q_current",
            Register::DCurrent => "d_current",
            Register::AbsPosition => "abs_position",
            Register::Power => "power",
            Register::MotorTemperature => "motor_temperature",
            Register::TrajectoryComplete => "trajectory_complete",
            Register::HomeState => "home_state",
            Register::Voltage => "voltage",
            Register::Temperature => "temperature",
            Register::Fault => "fault",
            Register::Encoder0Position => "encoder0_position",
            Register::Encoder0Velocity => "encoder0_velocity",
            Register::Encoder1Position => "encoder1_position",
            Register::Encoder1Velocity => "encoder1_velocity",
            Register::Encoder2Position => "encoder2_position",
            Register::Encoder2Velocity => "encoder2_velocity",
            Register::EncoderValidity => "encoder_validity",
            Register::MillisecondCounter => "millisecond_counter",
            Register::ImuAccelX => "imu_accel_x",
            Register::ImuAccelY => "imu_accel_y",
            Register::ImuAccelZ => "imu_accel_z",
            Register::ImuGyroX => "imu_gyro_x",
            Register::ImuGyroY => "imu_gyro_y",
            Register::ImuGyroZ => "imu_gyro_z",
        }
    }

    pub fn from_address(addr: RegisterAddress) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.address() == addr)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.name() == name)
    }
}

/// Address → resolution lookup: the built-in table shadowed by caller overrides.
#[derive(Debug, Clone, Default)]
pub struct ResolutionRegistry {
    overrides: BTreeMap<RegisterAddress, Resolution>,
}

impl ResolutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or shadow an address; the last override for an address wins.
    pub fn set_override(&mut self, addr: RegisterAddress, res: Resolution) -> Result<()> {
        if !res.is_valid() {
            return Err(QueryError::InvalidResolution(addr));
        }
        self.overrides.insert(addr, res);
        Ok(())
    }

    pub fn with_override(mut self, addr: RegisterAddress, res: Resolution) -> Result<Self> {
        self.set_override(addr, res)?;
        Ok(self)
    }

    pub fn resolve(&self, addr: RegisterAddress) -> Result<Resolution> {
        self.overrides
            .get(&addr)
            .copied()
            .or_else(|| Register::from_address(addr).map(Register::resolution))
            .ok_or(QueryError::UnknownRegister(addr))
    }
}

/// The registers one query reads, each with exactly one resolution.
///
/// Ordered by address and immutable once built; queries borrow it, async
/// queries clone it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    entries: BTreeMap<RegisterAddress, Resolution>,
}

impl QuerySpec {
    /// Reads nothing; a query with it issues no bus traffic.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builder seeded with [`DEFAULT_QUERY`].
    pub fn builder() -> QuerySpecBuilder {
        QuerySpecBuilder::with_defaults()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, addr: RegisterAddress) -> Option<Resolution> {
        self.entries.get(&addr).copied()
    }

    pub fn contains(&self, addr: RegisterAddress) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegisterAddress, Resolution)> + '_ {
        self.entries.iter().map(|(a, r)| (*a, *r))
    }

    pub fn addresses(&self) -> impl Iterator<Item = RegisterAddress> + '_ {
        self.entries.keys().copied()
    }
}

/// Collects registers for a [`QuerySpec`]; the first failing step is reported by `build`.
#[derive(Debug, Default)]
pub struct QuerySpecBuilder {
    registry: ResolutionRegistry,
    entries: BTreeMap<RegisterAddress, Resolution>,
    error: Option<QueryError>,
}

impl QuerySpecBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut b = Self::new();
        for reg in DEFAULT_QUERY {
            b.entries.insert(reg.address(), reg.resolution());
        }
        b
    }

    /// Registry consulted by [`read`](Self::read).
    pub fn registry(mut self, registry: ResolutionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Read `addr` with whatever resolution the registry has for it.
    pub fn read(mut self, addr: RegisterAddress) -> Self {
        if self.error.is_none() {
            match self.registry.resolve(addr) {
                Ok(res) => {
                    self.entries.insert(addr, res);
                }
                Err(e) => self.error = Some(e),
            }
        }
        self
    }

    pub fn read_register(self, reg: Register) -> Self {
        self.read(reg.address())
    }

    /// Read `addr` as `res`, replacing any resolution already chosen for it.
    pub fn with(mut self, addr: RegisterAddress, res: Resolution) -> Self {
        if self.error.is_none() {
            if res.is_valid() {
                self.entries.insert(addr, res);
            } else {
                self.error = Some(QueryError::InvalidResolution(addr));
            }
        }
        self
    }

    pub fn without(mut self, addr: RegisterAddress) -> Self {
        self.entries.remove(&addr);
        self
    }

    pub fn build(self) -> Result<QuerySpec> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(QuerySpec {
                entries: self.entries,
            }),
        }
    }
}

/// The default query with `overrides` merged on top (overrides win).
pub fn build_query_spec(overrides: &BTreeMap<RegisterAddress, Resolution>) -> Result<QuerySpec> {
    overrides
        .iter()
        .fold(QuerySpec::builder(), |b, (addr, res)| b.with(*addr, *res))
        .build()
}
