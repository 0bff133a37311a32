//! Command-line front end for the ICE bridge stack, mirroring
//! `m3_common.py`'s `argparse` subcommands and exit-code convention:
//! `0` success, `1` user/serial-selection error, `2` CLI parse error
//! (handled by clap itself), `3` invalid input binary.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info};

use ice_bridge::config::IceConfig;
use ice_bridge::error::{IceError, IceResult};
use ice_bridge::goc::{build_injection_message, GocVersion, InjectionControl};
use ice_bridge::mbus::MBusTransport;
use ice_bridge::session::IceSession;
use ice_bridge::target::TargetController;

#[derive(Parser)]
#[command(name = "ice-bridge-cli", version, about = "ICE bridge host tool")]
struct Cli {
    /// Serial device path; autodetected if omitted.
    #[arg(long)]
    serial: Option<String>,

    /// Baud rate; autodetected if omitted.
    #[arg(long)]
    baudrate: Option<u32>,

    #[arg(long)]
    debug: bool,

    /// Skip interactive confirmation prompts.
    #[arg(long)]
    yes: bool,

    /// Block waiting for asynchronous snoop/log traffic instead of
    /// returning once the request completes.
    #[arg(long)]
    wait_for_messages: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pulse the MBus internal reset line.
    Reset,
    /// Power-cycle all rails.
    Hardreset,
    Power {
        #[command(subcommand)]
        state: OnOff,
    },
    /// Stream MBus snoop traffic to stdout (and, with --wait-for-messages, keep listening).
    Snoop,
    /// Inject a binary image over the EIN channel.
    Ein { binfile: String },
    Goc {
        #[command(subcommand)]
        action: GocAction,
    },
    Mbus {
        #[command(subcommand)]
        action: MbusAction,
    },
}

#[derive(Subcommand)]
enum OnOff {
    On,
    Off,
}

#[derive(Subcommand)]
enum GocAction {
    On,
    Off,
    Message { addr: String, data: String },
    Flash { binfile: String },
}

#[derive(Subcommand)]
enum MbusAction {
    Program { binfile: String },
    Gdb,
}

fn main() {
    let cli = Cli::parse();
    let log_level = if cli.debug { "debug" } else { "info" };
    pretty_env_logger::formatted_builder()
        .parse_filters(log_level)
        .init();

    std::process::exit(match run(cli) {
        Ok(()) => 0,
        Err(e @ IceError::ParameterError(_)) | Err(e @ IceError::NotConnected) => {
            error!("{e}");
            1
        }
        Err(e) => {
            error!("{e}");
            3
        }
    });
}

fn run(cli: Cli) -> IceResult<()> {
    let mut config = IceConfig {
        serial_path: cli.serial.clone(),
        assume_yes: cli.yes,
        wait_for_messages: cli.wait_for_messages,
        ..IceConfig::default()
    };

    let path = config.resolve_serial_path()?;
    config.baud = match cli.baudrate {
        Some(b) => b,
        None => config
            .autodetect_baud(&path)
            .unwrap_or(ice_bridge::serial::DEFAULT_BAUD),
    };
    let baud = config.baud;
    info!("opening {path} at {baud} baud");

    let port = serialport::new(&path, baud)
        .timeout(Duration::from_secs(5))
        .open()
        .map_err(|e| IceError::ParameterError(format!("failed to open {path}: {e}")))?;
    let reader = port
        .try_clone()
        .map_err(|e| IceError::ParameterError(format!("failed to clone serial handle: {e}")))?;

    let session = Arc::new(IceSession::new(reader, port, baud));
    session.connect()?;

    match cli.command {
        Command::Reset => {
            let mbus = MBusTransport::new(session, config.mbus_prefix)?;
            mbus.mbus_set_internal_reset(true)?;
            std::thread::sleep(Duration::from_millis(50));
            mbus.mbus_set_internal_reset(false)
        }
        Command::Hardreset => {
            for idx in 0..3u8 {
                session.send(b'p', vec![b'o', idx, 0])?;
            }
            std::thread::sleep(Duration::from_millis(100));
            for idx in 0..3u8 {
                session.send(b'p', vec![b'o', idx, 1])?;
            }
            Ok(())
        }
        Command::Power { state } => {
            let on = matches!(state, OnOff::On);
            for idx in 0..3u8 {
                session.send(b'p', vec![b'o', idx, on as u8])?;
            }
            Ok(())
        }
        Command::Snoop => run_snoop(&session, config.wait_for_messages),
        Command::Ein { binfile } => {
            let image = read_binary(&binfile)?;
            send_injection(&session, GocVersion::V4, &image)
        }
        Command::Goc { action } => match action {
            GocAction::On => session.send(b'p', vec![b'o', 3, 1]).map(|_| ()),
            GocAction::Off => session.send(b'p', vec![b'o', 3, 0]).map(|_| ()),
            GocAction::Message { addr, data } => {
                let memory_address = parse_hex_u32(&addr)?;
                let payload = parse_hex_bytes(&data)?;
                let msg = build_injection_message(
                    GocVersion::V4,
                    InjectionControl::default(),
                    0,
                    memory_address,
                    Some(&payload),
                )?;
                session.send_fragmented(b'e', &msg).map(|_| ())
            }
            GocAction::Flash { binfile } => {
                let image = read_binary(&binfile)?;
                send_injection(&session, GocVersion::V4, &image)
            }
        },
        Command::Mbus { action } => match action {
            MbusAction::Program { binfile } => {
                let image = read_binary(&binfile)?;
                let mbus = MBusTransport::new(session, config.mbus_prefix)?;
                mbus.program(config.mbus_prefix, &image, 128)
            }
            MbusAction::Gdb => {
                let mbus = Arc::new(MBusTransport::new(session, config.mbus_prefix)?);
                let target = Arc::new(TargetController::new(mbus, true));
                let server = ice_bridge::gdb::GdbServer::new(target, config.gdb_port);
                info!("gdb stub listening on 127.0.0.1:{}", config.gdb_port);
                server.serve()
            }
        },
    }
}

fn read_binary(path: &str) -> IceResult<Vec<u8>> {
    fs::read(path).map_err(|e| IceError::FormatError(format!("cannot read {path}: {e}")))
}

fn send_injection<R, W>(session: &Arc<IceSession<R, W>>, version: GocVersion, image: &[u8]) -> IceResult<()>
where
    R: std::io::Read + Send + 'static,
    W: std::io::Write + Send + 'static,
{
    let msg = build_injection_message(version, InjectionControl::default(), 0, 0, Some(image))?;
    session.send_fragmented(b'e', &msg).map(|_| ())
}

fn run_snoop<R, W>(session: &Arc<IceSession<R, W>>, wait_for_messages: bool) -> IceResult<()>
where
    R: std::io::Read + Send + 'static,
    W: std::io::Write + Send + 'static,
{
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    let (tx, rx) = std::sync::mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    session.register_handler(b'b', move |frame| {
        let _ = tx.lock().unwrap().send(frame);
    });
    let deadline = if wait_for_messages {
        None
    } else {
        Some(std::time::Instant::now() + Duration::from_secs(5))
    };
    loop {
        let timeout = match deadline {
            Some(d) => d.saturating_duration_since(std::time::Instant::now()),
            None => Duration::from_secs(3600),
        };
        if timeout.is_zero() {
            break;
        }
        match rx.recv_timeout(timeout) {
            Ok(frame) => {
                if frame.payload.len() >= 5 {
                    let addr = &frame.payload[0..4];
                    let data = &frame.payload[4..frame.payload.len() - 1];
                    let control = frame.payload[frame.payload.len() - 1];
                    writer
                        .write_record([
                            unix_time_secs().to_string(),
                            to_hex(addr),
                            to_hex(data),
                            ((control & 1) != 0).to_string(),
                            ((control >> 1) & 1 != 0).to_string(),
                        ])
                        .map_err(|e| IceError::FormatError(e.to_string()))?;
                    writer.flush().ok();
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                if !wait_for_messages {
                    break;
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unix_time_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parse_hex_u32(s: &str) -> IceResult<u32> {
    let s = s.trim_start_matches("0x");
    u32::from_str_radix(s, 16).map_err(|e| IceError::ParameterError(format!("bad hex address {s}: {e}")))
}

fn parse_hex_bytes(s: &str) -> IceResult<Vec<u8>> {
    let s = s.trim_start_matches("0x");
    if s.len() % 2 != 0 {
        return Err(IceError::ParameterError("hex data must have even length".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|e| IceError::ParameterError(format!("bad hex byte {}: {e}", &s[i..i + 2])))
        })
        .collect()
}
