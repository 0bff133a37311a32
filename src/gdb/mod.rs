//! A TCP-hosted GDB remote-serial-protocol server translating a subset of
//! GDB's packet set into `TargetController` operations: register/memory
//! access, software breakpoints via an `SVC #01` trap, and single-step via
//! the bundled Thumb interpreter in [`step`].

pub mod packet;
pub mod step;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::{IceError, IceResult};
use crate::target::TargetController;

/// `SVC #01`, the Thumb trap instruction planted in place of a displaced
/// instruction to implement software breakpoints.
const SVC_01: u16 = 0xdf01;

/// GDB register order, distinct from the on-chip storage order.
const GDB_REGS: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "sp", "lr",
    "pc", "f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "fps", "xpsr",
];

fn reg_pad_bytes(name: &str) -> usize {
    if matches!(name, "f0" | "f1" | "f2" | "f3" | "f4" | "f5" | "f6" | "f7") {
        8
    } else {
        0
    }
}

fn le_hex_u32(val: u32) -> String {
    val.to_le_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_hex_u32(s: &str) -> IceResult<u32> {
    u32::from_str_radix(s, 16).map_err(|_| IceError::ParameterError(format!("bad hex: {s}")))
}

/// Per-connection software breakpoint table: `addr -> original 16-bit
/// instruction`. Owned entirely by the connection's RX thread.
type Breakpoints = Mutex<HashMap<u32, u16>>;

pub struct GdbServer<R, W> {
    target: Arc<TargetController<R, W>>,
    port: u16,
}

impl<R, W> GdbServer<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    pub fn new(target: Arc<TargetController<R, W>>, port: u16) -> Self {
        Self { target, port }
    }

    /// Blocking accept loop. Serves one GDB client to completion (until
    /// it detaches or disconnects) before accepting the next, matching
    /// a single-TCP-connection debug server.
    pub fn serve(&self) -> IceResult<()> {
        let listener = TcpListener::bind(("127.0.0.1", self.port))?;
        info!("gdb server listening on port {}", self.port);
        for incoming in listener.incoming() {
            let stream = incoming?;
            info!("gdb client connected from {:?}", stream.peer_addr());
            if let Err(e) = self.serve_one(stream) {
                warn!("gdb connection ended: {e}");
            }
        }
        Ok(())
    }

    fn serve_one(&self, stream: TcpStream) -> IceResult<()> {
        let mut rx_stream = stream.try_clone()?;
        let mut tx_stream = stream;

        let (resp_tx, resp_rx) = mpsc::sync_channel::<Vec<u8>>(64);

        let tx_handle = std::thread::spawn(move || {
            while let Ok(bytes) = resp_rx.recv() {
                if bytes.is_empty() {
                    break;
                }
                if tx_stream.write_all(&bytes).is_err() {
                    break;
                }
            }
        });

        let breakpoints: Breakpoints = Mutex::new(HashMap::new());
        let mut inbuf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 1024];

        let result = loop {
            let n = match rx_stream.read(&mut chunk) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(IceError::Io(e)),
            };
            let data = &chunk[..n];

            if data.contains(&0x03) {
                self.handle_ctrlc(&resp_tx);
            }

            inbuf.extend_from_slice(data);
            let mut fatal = None;
            loop {
                match packet::extract_packet(&mut inbuf) {
                    None => break,
                    Some(Err(())) => {
                        warn!("gdb checksum mismatch, ending connection");
                        let _ = resp_tx.send(packet::encode(""));
                        fatal = Some(IceError::FormatError("gdb checksum mismatch".into()));
                        break;
                    }
                    Some(Ok(msg)) => {
                        let _ = resp_tx.send(b"+".to_vec());
                        if !msg.is_empty() {
                            self.dispatch(&msg, &breakpoints, &resp_tx);
                        }
                    }
                }
            }
            if let Some(e) = fatal {
                break Err(e);
            }
        };

        let _ = resp_tx.send(Vec::new());
        let _ = tx_handle.join();
        result
    }

    fn handle_ctrlc(&self, resp_tx: &SyncSender<Vec<u8>>) {
        debug!("gdb ctrl-c received");
        self.reply_on_halt(resp_tx.clone());
    }

    /// `?` and Ctrl-C share this: reply immediately if already halted,
    /// otherwise issue a halt and let the halt-monitor thread deliver the
    /// reply asynchronously once the chip stops.
    fn reply_on_halt(&self, resp_tx: SyncSender<Vec<u8>>) {
        if self.target.is_halted() {
            let _ = resp_tx.send(packet::encode("S05"));
            return;
        }
        let result = self.target.halt(move |code| {
            let _ = resp_tx.send(packet::encode(code));
        });
        if let Err(e) = result {
            error!("halt request failed: {e}");
        }
    }

    fn dispatch(&self, msg: &str, breakpoints: &Breakpoints, resp_tx: &SyncSender<Vec<u8>>) {
        let cmd_type = msg.as_bytes()[0];
        let subcmd = &msg[1..];

        match cmd_type {
            b'?' => self.reply_on_halt(resp_tx.clone()),
            b'c' => self.cmd_continue(resp_tx),
            b's' => self.reply(resp_tx, self.cmd_step(breakpoints)),
            b'D' => self.reply(resp_tx, self.cmd_detach(breakpoints)),
            b'k' => {
                let _ = self.target.resume();
            }
            b'g' => self.reply(resp_tx, self.cmd_read_all_regs()),
            b'p' => self.reply(resp_tx, self.cmd_read_reg(subcmd)),
            b'P' => self.reply(resp_tx, self.cmd_write_reg(subcmd)),
            b'm' => self.reply(resp_tx, self.cmd_read_mem(subcmd)),
            b'M' => self.reply(resp_tx, self.cmd_write_mem(subcmd)),
            b'Z' => self.reply(resp_tx, self.cmd_set_break(subcmd, breakpoints)),
            b'z' => self.reply(resp_tx, self.cmd_clear_break(subcmd, breakpoints)),
            b'q' => self.reply(resp_tx, Ok(self.cmd_query(subcmd))),
            b'v' => self.reply(resp_tx, Ok(self.cmd_v(subcmd))),
            b'X' | b'H' => self.reply(resp_tx, Ok(String::new())),
            other => {
                warn!("unsupported gdb command {:?}", other as char);
                self.reply(resp_tx, Ok(String::new()));
            }
        }
    }

    fn reply(&self, resp_tx: &SyncSender<Vec<u8>>, result: IceResult<String>) {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                warn!("gdb command failed: {e}");
                String::new()
            }
        };
        let _ = resp_tx.send(packet::encode(&msg));
    }

    fn cmd_read_all_regs(&self) -> IceResult<String> {
        let mut resp = String::new();
        for name in GDB_REGS {
            resp.push_str(&self.read_reg_hex(name)?);
        }
        Ok(resp)
    }

    fn read_reg_hex(&self, name: &str) -> IceResult<String> {
        let mut val = self.target.regs.read(name)?;
        if name == "pc" {
            val = val.wrapping_sub(4);
        }
        Ok("00".repeat(reg_pad_bytes(name)) + &le_hex_u32(val))
    }

    fn cmd_read_reg(&self, subcmd: &str) -> IceResult<String> {
        let idx = u32::from_str_radix(subcmd, 16)
            .map_err(|_| IceError::ParameterError(format!("bad register index {subcmd}")))?
            as usize;
        let name = GDB_REGS
            .get(idx)
            .ok_or_else(|| IceError::ParameterError(format!("register index {idx} out of range")))?;
        self.read_reg_hex(name)
    }

    fn cmd_write_reg(&self, subcmd: &str) -> IceResult<String> {
        let (idx_str, val_str) = subcmd
            .split_once('=')
            .ok_or_else(|| IceError::ParameterError("malformed P packet".into()))?;
        let idx = u32::from_str_radix(idx_str, 16)
            .map_err(|_| IceError::ParameterError(format!("bad register index {idx_str}")))?
            as usize;
        let name = GDB_REGS
            .get(idx)
            .ok_or_else(|| IceError::ParameterError(format!("register index {idx} out of range")))?;
        // value arrives little-endian hex; un-swap to a native u32.
        let raw = hex_to_bytes(val_str)?;
        let mut bytes = [0u8; 4];
        for (i, b) in raw.iter().take(4).enumerate() {
            bytes[i] = *b;
        }
        let mut val = u32::from_le_bytes(bytes);
        if name == "pc" {
            // force_write subtracts 4 back out before storing; add it
            // here so the stored value matches what GDB sent.
            val = val.wrapping_add(4);
        }
        self.target.regs.force_write(name, val)?;
        Ok("OK".to_string())
    }

    fn cmd_read_mem(&self, subcmd: &str) -> IceResult<String> {
        let (addr_str, len_str) = subcmd
            .split_once(',')
            .ok_or_else(|| IceError::ParameterError("malformed m packet".into()))?;
        let mut addr = parse_hex_u32(addr_str)?;
        let mut remaining = parse_hex_u32(len_str)? as usize;
        let mut resp = String::new();
        while remaining > 0 {
            let (read_bytes, size_bits) = if remaining >= 4 && addr % 4 == 0 {
                (4, 32)
            } else {
                (1, 8)
            };
            let val = self.target.memory.read(addr, size_bits)?;
            if read_bytes == 4 {
                resp.push_str(&le_hex_u32(val));
            } else {
                resp.push_str(&format!("{:02x}", val & 0xff));
            }
            addr += read_bytes as u32;
            remaining -= read_bytes.min(remaining);
        }
        Ok(resp)
    }

    fn cmd_write_mem(&self, subcmd: &str) -> IceResult<String> {
        let (preamble, data) = subcmd
            .split_once(':')
            .ok_or_else(|| IceError::ParameterError("malformed M packet".into()))?;
        let (addr_str, _len_str) = preamble
            .split_once(',')
            .ok_or_else(|| IceError::ParameterError("malformed M packet".into()))?;
        let mut addr = parse_hex_u32(addr_str)?;
        let bytes = hex_to_bytes(data)?;
        for byte in bytes {
            self.target.memory.force_write(addr, 8, byte as u32)?;
            addr += 1;
        }
        Ok("OK".to_string())
    }

    fn cmd_set_break(&self, subcmd: &str, breakpoints: &Breakpoints) -> IceResult<String> {
        let (bp_type, addr, size) = parse_break_args(subcmd)?;
        if bp_type != 0 || size != 2 {
            return Err(IceError::ParameterError(
                "only software breakpoints supported".into(),
            ));
        }
        self.install_breakpoint(addr, breakpoints)?;
        Ok("OK".to_string())
    }

    fn cmd_clear_break(&self, subcmd: &str, breakpoints: &Breakpoints) -> IceResult<String> {
        let (bp_type, addr, size) = parse_break_args(subcmd)?;
        if bp_type != 0 || size != 2 {
            return Err(IceError::ParameterError(
                "only software breakpoints supported".into(),
            ));
        }
        self.remove_breakpoint(addr, breakpoints)?;
        Ok("OK".to_string())
    }

    fn install_breakpoint(&self, addr: u32, breakpoints: &Breakpoints) -> IceResult<()> {
        let mut table = breakpoints.lock().unwrap();
        if table.contains_key(&addr) {
            debug!("breakpoint at {addr:#x} already installed");
            return Ok(());
        }
        let original = self.target.memory.read(addr, 16)? as u16;
        self.target.memory.force_write(addr, 16, SVC_01 as u32)?;
        table.insert(addr, original);
        Ok(())
    }

    fn remove_breakpoint(&self, addr: u32, breakpoints: &Breakpoints) -> IceResult<()> {
        let mut table = breakpoints.lock().unwrap();
        if let Some(original) = table.remove(&addr) {
            self.target.memory.force_write(addr, 16, original as u32)?;
        } else {
            debug!("no breakpoint installed at {addr:#x}");
        }
        Ok(())
    }

    fn cmd_continue(&self, resp_tx: &SyncSender<Vec<u8>>) {
        let resp_tx = resp_tx.clone();
        if let Err(e) = self.target.resume_with_callback(move |code| {
            let _ = resp_tx.send(packet::encode(code));
        }) {
            error!("continue failed: {e}");
        }
    }

    /// The 5-step single-step algorithm: displace any breakpoint at the
    /// current PC, interpret one instruction, plant a temporary trap at
    /// the computed next PC, resume and poll for the halt, then restore
    /// both breakpoint tables.
    fn cmd_step(&self, breakpoints: &Breakpoints) -> IceResult<String> {
        // RegisterFile::read adds 4 to the stored pc; step_one wants the
        // logical (stored) value back, same as GDB's own protocol view.
        let pc = self.target.regs.read("pc")?.wrapping_sub(4);

        let displaced = breakpoints.lock().unwrap().contains_key(&pc);
        if displaced {
            self.remove_breakpoint(pc, breakpoints)?;
        }

        let next_pc = step::step_one(&self.target.regs, &self.target.memory, pc)?;

        self.install_breakpoint(next_pc, breakpoints)?;
        self.target.resume()?;
        while !self.target.is_halted() {
            std::thread::sleep(Duration::from_millis(100));
        }
        self.remove_breakpoint(next_pc, breakpoints)?;
        if displaced {
            self.install_breakpoint(pc, breakpoints)?;
        }
        Ok("S05".to_string())
    }

    fn cmd_detach(&self, breakpoints: &Breakpoints) -> IceResult<String> {
        if !self.target.is_halted() {
            self.target.halt(|_| {})?;
            while !self.target.is_halted() {
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        let addrs: Vec<u32> = breakpoints.lock().unwrap().keys().copied().collect();
        for addr in addrs {
            self.remove_breakpoint(addr, breakpoints)?;
        }
        self.target.resume()?;
        Ok("OK".to_string())
    }

    fn cmd_query(&self, subcmd: &str) -> String {
        if subcmd.starts_with("Supported") {
            "PacketSize=4096".to_string()
        } else if subcmd.starts_with("Symbol") {
            "OK".to_string()
        } else {
            // qC, qfThreadInfo, qL..., qAttached, qOffsets, qTStatus
            String::new()
        }
    }

    fn cmd_v(&self, subcmd: &str) -> String {
        if subcmd.starts_with("Cont?") {
            "vCont;cs".to_string()
        } else {
            String::new()
        }
    }
}

fn parse_break_args(subcmd: &str) -> IceResult<(u32, u32, u32)> {
    let parts: Vec<&str> = subcmd.split(',').collect();
    if parts.len() != 3 {
        return Err(IceError::ParameterError(format!(
            "malformed Z/z args: {subcmd}"
        )));
    }
    Ok((
        parse_hex_u32(parts[0])?,
        parse_hex_u32(parts[1])?,
        parse_hex_u32(parts[2])?,
    ))
}

fn hex_to_bytes(s: &str) -> IceResult<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(IceError::FormatError("odd-length hex payload".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| IceError::FormatError(format!("bad hex byte in {s}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gdb_register_order_has_26_entries_with_fp_padding() {
        assert_eq!(GDB_REGS.len(), 26);
        assert_eq!(reg_pad_bytes("f3"), 8);
        assert_eq!(reg_pad_bytes("fps"), 0);
        assert_eq!(reg_pad_bytes("pc"), 0);
    }

    #[test]
    fn le_hex_encodes_little_endian() {
        assert_eq!(le_hex_u32(0x0100_0000), "00000001");
    }

    #[test]
    fn hex_to_bytes_round_trips() {
        assert_eq!(hex_to_bytes("deadbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert!(hex_to_bytes("abc").is_err());
    }
}
