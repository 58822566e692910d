use anyhow::{anyhow, bail, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use can_transport as can;
use can_transport::CanBus;
use register_query as rq;
use register_query::sim::SimController;
use register_query::{
    AsyncQueryClient, ControllerId, MetricsHub, QueryConfig, QueryError, QueryProfile,
    QueryResult, QuerySpec, QuerySpecBuilder, Register, RegisterAddress, Resolution,
    ResolutionKind,
};

/// 0.488 mg per LSB.
const ACCEL_MPS2_PER_LSB: f64 = 0.000488 * 9.80665;
const GYRO_DPS_PER_LSB: f64 = 0.07;
const DEFAULT_TIMEOUT_MS: u64 = 100;

#[derive(Parser, Debug)]
#[command(
    name = "rq",
    version,
    about = "Register queries for CAN motor controllers",
    disable_help_subcommand = true
)]
struct Cli {
    /// Print Prometheus metrics before exiting
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Backend {
    Mock,
    Slcan,
}

#[derive(Args, Debug, Clone)]
struct BusArgs {
    /// Backend to use
    #[arg(long, value_enum, default_value_t = Backend::Mock)]
    backend: Backend,
    /// Interface name or serial device path
    #[arg(long, default_value = "mock0")]
    device: String,
    /// Nominal bitrate for SLCAN
    #[arg(long, value_enum)]
    bitrate: Option<Bitrate>,
    /// CAN-FD data bitrate for SLCAN; classic frames when unset
    #[arg(long, value_enum)]
    fd_bitrate: Option<DataBitrate>,
    /// Controller id to query (default 1)
    #[arg(long)]
    target: Option<u8>,
    /// Per-frame reply timeout in milliseconds (default 100)
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Cap on payload bytes per frame
    #[arg(long)]
    max_payload: Option<usize>,
}

#[derive(Args, Debug, Clone)]
struct PollArgs {
    /// Seconds between polls
    #[arg(long, default_value_t = 0.1)]
    rate: f64,
    /// Stop after this many polls (otherwise until Ctrl+C)
    #[arg(long)]
    count: Option<u64>,
    /// Log a missed reply and keep polling instead of exiting
    #[arg(long)]
    keep_going: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available CAN interfaces
    CanList {
        #[arg(long, value_enum, default_value_t = Backend::Mock)]
        backend: Backend,
    },
    /// Poll registers and print every value returned
    Query {
        #[command(flatten)]
        bus: BusArgs,
        #[command(flatten)]
        poll: PollArgs,
        /// Register as ADDR:TYPE or ADDR:TYPE:SCALE (e.g. 0x072:int16)
        #[arg(long = "reg")]
        regs: Vec<String>,
        /// YAML query profile
        #[arg(long)]
        profile: Option<String>,
        /// Leave out the default register set
        #[arg(long, action = ArgAction::SetTrue)]
        no_defaults: bool,
        /// One JSON record per poll
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Poll the onboard IMU in physical units
    Imu {
        #[command(flatten)]
        bus: BusArgs,
        #[command(flatten)]
        poll: PollArgs,
        /// Also read position and absolute position
        #[arg(long, action = ArgAction::SetTrue)]
        with_encoders: bool,
    },
    /// Scan motor and auxiliary encoder positions
    Encoders {
        #[command(flatten)]
        bus: BusArgs,
        #[command(flatten)]
        poll: PollArgs,
        /// Also read encoder 2 velocity
        #[arg(long, action = ArgAction::SetTrue)]
        velocity: bool,
    },
    /// Validate query profiles
    ProfileValidate {
        /// YAML file path
        #[arg(long)]
        file: Option<String>,
        /// Directory containing YAML profiles
        #[arg(long)]
        dir: Option<String>,
        /// Print JSON after validation
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
}

#[derive(Copy, Clone, Debug)]
enum Report {
    Registers { json: bool },
    Imu { with_encoders: bool },
    Encoders { velocity: bool },
}

/// One resolved polling run.
struct Job {
    target: ControllerId,
    spec: QuerySpec,
    timeout: Duration,
    config: QueryConfig,
    every: Duration,
    count: Option<u64>,
    keep_going: bool,
    report: Report,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let print_metrics = cli.metrics;

    let (bus, job) = match cli.command {
        Commands::CanList { backend } => return can_list_backend(backend),
        Commands::ProfileValidate { file, dir, json } => {
            return profile_validate(file.as_deref(), dir.as_deref(), json)
        }
        Commands::Query {
            bus,
            poll,
            regs,
            profile,
            no_defaults,
            json,
        } => {
            let job = query_job(&bus, &poll, &regs, profile.as_deref(), no_defaults, json)?;
            (bus, job)
        }
        Commands::Imu {
            bus,
            poll,
            with_encoders,
        } => {
            let mut regs = vec![
                Register::ImuAccelX,
                Register::ImuAccelY,
                Register::ImuAccelZ,
                Register::ImuGyroX,
                Register::ImuGyroY,
                Register::ImuGyroZ,
            ];
            if with_encoders {
                regs.extend([Register::Position, Register::AbsPosition]);
            }
            let job = fixed_job(&bus, &poll, &regs, Report::Imu { with_encoders })?;
            (bus, job)
        }
        Commands::Encoders {
            bus,
            poll,
            velocity,
        } => {
            let mut regs = vec![
                Register::Position,
                Register::AbsPosition,
                Register::Encoder0Position,
                Register::Encoder1Position,
                Register::Encoder2Position,
            ];
            if velocity {
                regs.push(Register::Encoder2Velocity);
            }
            let job = fixed_job(&bus, &poll, &regs, Report::Encoders { velocity })?;
            (bus, job)
        }
    };

    let hub = MetricsHub::new()?;
    match bus.backend {
        Backend::Mock => {
            let sim = demo_controller(job.target).with_prefix(job.config.prefix);
            run(sim.into_bus(&bus.device), job, &hub).await?;
        }
        Backend::Slcan => {
            let slcan = can::SlcanBus::open_fd(
                &bus.device,
                bus.bitrate.map(Bitrate::into_transport),
                bus.fd_bitrate.map(DataBitrate::into_transport),
            )?;
            run(slcan, job, &hub).await?;
        }
    }
    if print_metrics {
        print!("{}", hub.encode_text());
    }
    Ok(())
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run<B: CanBus + Send + 'static>(bus: B, job: Job, hub: &MetricsHub) -> Result<()> {
    let client = rq::QueryClient::new(bus, job.config.clone())?.with_metrics(hub.query.clone());
    let client = AsyncQueryClient::new(client);
    info!(
        controller = %job.target,
        registers = job.spec.len(),
        every_ms = job.every.as_millis() as u64,
        "polling"
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(job.every);
    let mut seq = 0u64;
    while job.count.map_or(true, |c| seq < c) {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {}
        }
        let result = tokio::select! {
            _ = &mut ctrl_c => break,
            r = client.query(job.target, &job.spec, job.timeout) => r,
        };
        match result {
            Ok(values) => print_report(job.report, seq, &job.spec, &values)?,
            Err(e) if skippable(&e, job.keep_going) => {
                warn!(error = %e, timeout_ms = job.timeout.as_millis() as u64, "no reply")
            }
            Err(e) => return Err(e.into()),
        }
        seq += 1;
    }
    info!(polls = seq, "done");
    Ok(())
}

/// Only a missed reply is survivable, and only when asked to keep going.
fn skippable(err: &QueryError, keep_going: bool) -> bool {
    keep_going && matches!(err, QueryError::Timeout(_))
}

fn target_id(raw: u8) -> Result<ControllerId> {
    ControllerId::new(raw).ok_or_else(|| anyhow!("target id {raw} exceeds 7 bits"))
}

fn poll_period(poll: &PollArgs) -> Result<Duration> {
    let every = Duration::try_from_secs_f64(poll.rate)
        .map_err(|e| anyhow!("invalid --rate {}: {e}", poll.rate))?;
    if every.is_zero() {
        bail!("--rate must be positive");
    }
    Ok(every)
}

fn base_config(bus: &BusArgs) -> QueryConfig {
    let fd = match bus.backend {
        Backend::Mock => true,
        Backend::Slcan => bus.fd_bitrate.is_some(),
    };
    QueryConfig {
        max_payload: bus.max_payload,
        fd,
        ..QueryConfig::default()
    }
}

fn fixed_job(bus: &BusArgs, poll: &PollArgs, regs: &[Register], report: Report) -> Result<Job> {
    let spec = regs
        .iter()
        .fold(QuerySpecBuilder::new(), |b, r| b.read_register(*r))
        .build()?;
    Ok(Job {
        target: target_id(bus.target.unwrap_or(1))?,
        spec,
        timeout: Duration::from_millis(bus.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
        config: base_config(bus),
        every: poll_period(poll)?,
        count: poll.count,
        keep_going: poll.keep_going,
        report,
    })
}

fn query_job(
    bus: &BusArgs,
    poll: &PollArgs,
    regs: &[String],
    profile: Option<&str>,
    no_defaults: bool,
    json: bool,
) -> Result<Job> {
    let profile: Option<QueryProfile> = profile.map(|p| rq::load_profile_file(p)).transpose()?;

    let defaults = !no_defaults && profile.as_ref().map_or(true, |p| p.defaults);
    let mut builder = if defaults {
        QuerySpecBuilder::with_defaults()
    } else {
        QuerySpecBuilder::new()
    };
    for entry in profile.iter().flat_map(|p| &p.registers) {
        let (addr, res) = entry.resolve()?;
        builder = builder.with(addr, res);
    }
    for arg in regs {
        let (addr, res) = parse_reg_arg(arg)?;
        builder = builder.with(addr, res);
    }
    let spec = builder.build()?;
    if spec.is_empty() {
        bail!("no registers to query; pass --reg or drop --no-defaults");
    }

    let mut config = base_config(bus);
    let mut target = bus.target;
    let mut timeout = bus.timeout_ms.map(Duration::from_millis);
    if let Some(p) = &profile {
        let from_profile = p.query_config();
        config = QueryConfig {
            max_payload: bus.max_payload.or(from_profile.max_payload),
            fd: config.fd && from_profile.fd,
            ..from_profile
        };
        target = target.or(Some(p.controller));
        timeout = timeout.or(Some(p.timeout()));
    }

    Ok(Job {
        target: target_id(target.unwrap_or(1))?,
        spec,
        timeout: timeout.unwrap_or(Duration::from_millis(DEFAULT_TIMEOUT_MS)),
        config,
        every: poll_period(poll)?,
        count: poll.count,
        keep_going: poll.keep_going,
        report: Report::Registers { json },
    })
}

/// Parse `ADDR:TYPE` or `ADDR:TYPE:SCALE`.
fn parse_reg_arg(s: &str) -> Result<(RegisterAddress, Resolution)> {
    let mut parts = s.split(':');
    let addr = parts
        .next()
        .and_then(rq::parse_address)
        .ok_or_else(|| anyhow!("invalid register address in '{s}'"))?;
    let kind: ResolutionKind = parts
        .next()
        .ok_or_else(|| anyhow!("missing type in '{s}' (expected ADDR:TYPE)"))?
        .parse()
        .map_err(anyhow::Error::msg)?;
    let scale = parts
        .next()
        .map(|v| v.trim().parse::<f64>())
        .transpose()
        .map_err(|e| anyhow!("invalid scale in '{s}': {e}"))?;
    if parts.next().is_some() {
        bail!("too many fields in '{s}'");
    }
    let res = kind
        .resolve(scale)
        .ok_or(QueryError::InvalidResolution(addr))?;
    Ok((addr, res))
}

/// Demo controller for the mock backend.
fn demo_controller(id: ControllerId) -> SimController {
    Register::ALL
        .into_iter()
        .fold(SimController::new(id), |sim, reg| {
            sim.with_register(reg.address(), reg.resolution(), demo_value(reg))
        })
        .with_ramp(Register::Position.address(), 0.01)
        .with_ramp(Register::Encoder0Position.address(), 0.01)
        .with_ramp(Register::MillisecondCounter.address(), 100.0)
}

fn demo_value(reg: Register) -> f64 {
    match reg {
        Register::Mode => 10.0,
        Register::Velocity => 0.5,
        Register::AbsPosition => 0.25,
        Register::Voltage => 24.0,
        Register::Temperature => 32.0,
        Register::MotorTemperature => 35.0,
        Register::EncoderValidity => 7.0,
        // 1 g at rest
        Register::ImuAccelZ => 2049.0,
        Register::ImuGyroZ => 3.0,
        _ => 0.0,
    }
}

fn print_report(report: Report, seq: u64, spec: &QuerySpec, values: &QueryResult) -> Result<()> {
    match report {
        Report::Registers { json: true } => {
            println!("{}", serde_json::to_string(&PollRecord::new(seq, spec, values))?)
        }
        Report::Registers { json: false } => println!("{}", register_line(seq, spec, values)),
        Report::Imu { with_encoders } => println!("{}", imu_line(values, with_encoders)),
        Report::Encoders { velocity } => println!("{}", encoder_line(values, velocity)),
    }
    Ok(())
}

#[derive(Serialize)]
struct PollRecord {
    seq: u64,
    ts: String,
    /// `null` for registers the controller did not report.
    values: BTreeMap<String, Option<f64>>,
}

impl PollRecord {
    fn new(seq: u64, spec: &QuerySpec, values: &QueryResult) -> Self {
        let ts = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "".into());
        PollRecord {
            seq,
            ts,
            values: spec
                .addresses()
                .map(|a| (label(a), values.get(a)))
                .collect(),
        }
    }
}

fn label(addr: RegisterAddress) -> String {
    Register::from_address(addr)
        .map(|r| r.name().to_string())
        .unwrap_or_else(|| addr.to_string())
}

fn fmt_opt(v: Option<f64>, precision: usize) -> String {
    v.map(|v| format!("{v:.precision$}"))
        .unwrap_or_else(|| "-".into())
}

fn register_line(seq: u64, spec: &QuerySpec, values: &QueryResult) -> String {
    let mut line = seq.to_string();
    for addr in spec.addresses() {
        let v = values
            .get(addr)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".into());
        line.push_str(&format!("\t{}={v}", label(addr)));
    }
    line
}

fn accel_mps2(raw: f64) -> f64 {
    raw * ACCEL_MPS2_PER_LSB
}

fn gyro_dps(raw: f64) -> f64 {
    raw * GYRO_DPS_PER_LSB
}

fn magnitude(v: [Option<f64>; 3]) -> Option<f64> {
    let [x, y, z] = v;
    let (x, y, z) = (x?, y?, z?);
    Some((x * x + y * y + z * z).sqrt())
}

fn imu_line(values: &QueryResult, with_encoders: bool) -> String {
    let get = |r: Register| values.get(r.address());
    let accel = [Register::ImuAccelX, Register::ImuAccelY, Register::ImuAccelZ]
        .map(|r| get(r).map(accel_mps2));
    let gyro = [Register::ImuGyroX, Register::ImuGyroY, Register::ImuGyroZ]
        .map(|r| get(r).map(gyro_dps));
    let mut line = format!(
        "accel m/s2 x={} y={} z={} |a|={}\tgyro dps x={} y={} z={}",
        fmt_opt(accel[0], 3),
        fmt_opt(accel[1], 3),
        fmt_opt(accel[2], 3),
        fmt_opt(magnitude(accel), 3),
        fmt_opt(gyro[0], 2),
        fmt_opt(gyro[1], 2),
        fmt_opt(gyro[2], 2),
    );
    if with_encoders {
        let deg = |r: Register| get(r).map(|rev| rev * 360.0);
        line.push_str(&format!(
            "\tpos deg={} abs deg={}",
            fmt_opt(deg(Register::Position), 2),
            fmt_opt(deg(Register::AbsPosition), 2)
        ));
    }
    line
}

fn encoder_line(values: &QueryResult, velocity: bool) -> String {
    let fields = [
        ("pos", Register::Position),
        ("abs", Register::AbsPosition),
        ("enc0", Register::Encoder0Position),
        ("enc1", Register::Encoder1Position),
        ("enc2", Register::Encoder2Position),
    ];
    let mut parts: Vec<String> = fields
        .iter()
        .map(|(name, reg)| {
            let rev = values.get(reg.address());
            format!(
                "{name}={}rev/{}deg",
                fmt_opt(rev, 4),
                fmt_opt(rev.map(|r| r * 360.0), 2)
            )
        })
        .collect();
    if velocity {
        let v = values.get(Register::Encoder2Velocity.address());
        parts.push(format!("enc2_vel={}rev/s", fmt_opt(v, 4)));
    }
    parts.join("\t")
}

fn can_list_backend(backend: Backend) -> Result<()> {
    let buses = match backend {
        Backend::Mock => can::MockBus::list()?,
        Backend::Slcan => can::SlcanBus::list()?,
    };
    for bus in buses {
        println!("{}\t{}", bus.name, bus.driver);
    }
    Ok(())
}

fn profile_validate(file: Option<&str>, dir: Option<&str>, json: bool) -> Result<()> {
    match (file, dir) {
        (Some(f), None) => {
            let profile = rq::load_profile_file(f)?;
            println!(
                "ok: {} (controller={}, registers={})",
                profile.name.as_deref().unwrap_or(f),
                profile.controller,
                profile.query_spec()?.len()
            );
            if json {
                println!("{}", serde_json::to_string_pretty(&profile)?);
            }
        }
        (None, Some(d)) => {
            let set = rq::load_profiles_dir(d)?;
            println!("ok: loaded {} profiles", set.profiles.len());
            if json {
                println!("{}", serde_json::to_string_pretty(&set.profiles)?);
            }
        }
        _ => {
            return Err(anyhow!("provide --file <path> or --dir <dir>"));
        }
    }
    Ok(())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Bitrate {
    #[value(name = "125k")]
    B125k,
    #[value(name = "250k")]
    B250k,
    #[value(name = "500k")]
    B500k,
    #[value(name = "1m")]
    B1M,
}

impl Bitrate {
    fn into_transport(self) -> can::SlcanBitrate {
        match self {
            Bitrate::B125k => can::SlcanBitrate::B125k,
            Bitrate::B250k => can::SlcanBitrate::B250k,
            Bitrate::B500k => can::SlcanBitrate::B500k,
            Bitrate::B1M => can::SlcanBitrate::B1M,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum DataBitrate {
    #[value(name = "2m")]
    M2,
    #[value(name = "5m")]
    M5,
}

impl DataBitrate {
    fn into_transport(self) -> can::SlcanDataBitrate {
        match self {
            DataBitrate::M2 => can::SlcanDataBitrate::M2,
            DataBitrate::M5 => can::SlcanDataBitrate::M5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_end_polling_unless_keep_going() {
        let timeout = QueryError::Timeout(ControllerId::new(1).unwrap());
        assert!(!skippable(&timeout, false));
        assert!(skippable(&timeout, true));
        let io = QueryError::Transport(can_transport::TransportError::Io("gone".into()));
        assert!(!skippable(&io, true));
    }

    #[test]
    fn reg_arg_forms() -> anyhow::Result<()> {
        assert_eq!(
            parse_reg_arg("0x072:int16")?,
            (RegisterAddress(0x072), Resolution::Int16)
        );
        let (addr, res) = parse_reg_arg("13:fixed8:0.5")?;
        assert_eq!(addr, RegisterAddress(13));
        assert_eq!(res, Resolution::fixed(8, 0.5).unwrap());
        assert!(parse_reg_arg("0x072").is_err());
        assert!(parse_reg_arg("0x072:int16:2").is_err());
        assert!(parse_reg_arg("0x072:fixed16").is_err());
        Ok(())
    }

    #[test]
    fn one_g_in_physical_units() {
        let values: QueryResult = [
            (Register::ImuAccelX.address(), 0.0),
            (Register::ImuAccelY.address(), 0.0),
            (Register::ImuAccelZ.address(), 2049.0),
        ]
        .into_iter()
        .collect();
        let line = imu_line(&values, false);
        assert!(line.contains("z=9.806"), "{line}");
        assert!(line.contains("|a|=9.806"), "{line}");
        assert!(line.contains("gyro dps x=- y=- z=-"), "{line}");
    }

    #[test]
    fn missing_registers_print_as_dash() -> anyhow::Result<()> {
        let spec = QuerySpecBuilder::new()
            .read_register(Register::Mode)
            .read_register(Register::Fault)
            .build()?;
        let values: QueryResult = [(Register::Mode.address(), 10.0)].into_iter().collect();
        assert_eq!(register_line(3, &spec, &values), "3\tmode=10\tfault=-");

        let record = PollRecord::new(3, &spec, &values);
        assert_eq!(record.values.get("fault"), Some(&None));
        Ok(())
    }

    #[test]
    fn magnitude_needs_every_axis() {
        assert_eq!(magnitude([Some(3.0), Some(4.0), Some(0.0)]), Some(5.0));
        assert_eq!(magnitude([Some(3.0), None, Some(0.0)]), None);
    }

    #[test]
    fn demo_controller_answers_the_default_query() -> anyhow::Result<()> {
        let target = target_id(1)?;
        let client = rq::QueryClient::new(
            demo_controller(target).into_bus("mock0"),
            QueryConfig::default(),
        )?;
        let spec = QuerySpec::builder().build()?;
        let out = client.query(target, &spec, Duration::from_millis(10))?;
        assert_eq!(out.len(), spec.len());
        assert_eq!(out.get(Register::Voltage.address()), Some(24.0));
        Ok(())
    }
}
