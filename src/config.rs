//! Runtime configuration, constructed either programmatically or from
//! CLI flags. Mirrors `m3_common.py`'s `argparse`-driven bootstrap: a
//! serial port (or autodetect), a baud rate, the GDB listen port, the
//! PRC's MBus short prefix, and a log level.

use std::time::Duration;

use log::LevelFilter;

use crate::error::{IceError, IceResult};
use crate::serial::{find_baud, AUTODETECT_BAUDS, DEFAULT_BAUD};

/// Default MBus short prefix used to address the PRC, matching
/// `mbus::DEFAULT_PREFIX`.
pub const DEFAULT_GDB_PORT: u16 = 10001;

#[derive(Debug, Clone)]
pub struct IceConfig {
    pub serial_path: Option<String>,
    pub baud: u32,
    pub gdb_port: u16,
    pub mbus_prefix: u8,
    pub log_level: LevelFilter,
    pub assume_yes: bool,
    pub wait_for_messages: bool,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            serial_path: None,
            baud: DEFAULT_BAUD,
            gdb_port: DEFAULT_GDB_PORT,
            mbus_prefix: crate::mbus::DEFAULT_PREFIX,
            log_level: LevelFilter::Info,
            assume_yes: false,
            wait_for_messages: false,
        }
    }
}

impl IceConfig {
    /// Returns the configured serial path, or the first port reported
    /// by the platform's enumerator if none was given. Matches
    /// `m3_common.py`'s `guess_serial`, which exits with an error when
    /// no candidate ports exist (CLI exit code 1, spec.md §6).
    pub fn resolve_serial_path(&self) -> IceResult<String> {
        if let Some(path) = &self.serial_path {
            return Ok(path.clone());
        }
        let ports = serialport::available_ports()
            .map_err(|e| IceError::ParameterError(format!("failed to list serial ports: {e}")))?;
        ports
            .into_iter()
            .next()
            .map(|p| p.port_name)
            .ok_or_else(|| IceError::ParameterError("no serial ports found".into()))
    }

    /// Autodetects the bridge's baud rate on `serial_path` by trying
    /// `AUTODETECT_BAUDS` in turn, matching `ice.py`'s `find_baud`.
    pub fn autodetect_baud(&self, serial_path: &str) -> IceResult<u32> {
        let (baud, _port) = find_baud(&AUTODETECT_BAUDS, Duration::from_millis(200), |baud| {
            serialport::new(serial_path, baud)
                .timeout(Duration::from_millis(200))
                .open()
                .map_err(|e| IceError::ParameterError(format!("failed to open {serial_path}: {e}")))
        })?;
        Ok(baud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_documented_port_and_prefix() {
        let cfg = IceConfig::default();
        assert_eq!(cfg.gdb_port, 10001);
        assert_eq!(cfg.mbus_prefix, crate::mbus::DEFAULT_PREFIX);
        assert_eq!(cfg.baud, DEFAULT_BAUD);
    }

    #[test]
    fn explicit_serial_path_is_returned_verbatim() {
        let cfg = IceConfig {
            serial_path: Some("/dev/ttyUSB7".into()),
            ..IceConfig::default()
        };
        assert_eq!(cfg.resolve_serial_path().unwrap(), "/dev/ttyUSB7");
    }
}
