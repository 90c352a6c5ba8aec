//! Host side of the guest hypercall protocol. Guests reach these ports with
//! plain `in`/`out`; addresses travel as 32-bit offsets from null.

use crate::types::{ExitStats, GuestAddr};
use super::memory::GuestMem;
use log::{trace, warn};
use std::io::Write;

pub const PORT_PRINT_BYTE: u16 = 0xE9;
pub const PORT_PRINT_U32: u16 = 0xEA;
pub const PORT_EXIT_COUNT: u16 = 0xEB;
pub const PORT_PRINT_STR: u16 = 0xEC;
pub const PORT_EXITS_BY_TYPE: u16 = 0xED;
pub const PORT_TRANSLATE: u16 = 0xEE;


/// Little-endian integer payload, zero-extended when the access is narrower.
fn wire_u32(data: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    let n = data.len().min(raw.len());
    raw[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(raw)
}


/// Per-VM hypercall state plus the stream guest output is written to.
pub struct HypercallDevice {
    label: String,
    segment_base: u64,
    sink: Box<dyn Write + Send>,
    /// Last address sent to the translate port.
    translate_latch: GuestAddr,
}


impl HypercallDevice {
    pub fn new(label: impl Into<String>, segment_base: u64, sink: Box<dyn Write + Send>) -> Self {
        Self { label: label.into(), segment_base, sink, translate_latch: GuestAddr::default() }
    }

    fn guest_phys(&self, addr: GuestAddr) -> u64 {
        u64::from(addr.translate(self.segment_base))
    }

    /// Guest `out`. Unknown ports are logged and dropped, and so is output
    /// the sink refuses: a guest never fails on a hypercall.
    pub fn io_out(&mut self, port: u16, data: &[u8], mem: &GuestMem, stats: &ExitStats) {
        match port {
            PORT_PRINT_BYTE => {
                let byte = &data[..data.len().min(1)];
                self.emit(byte);
            }
            PORT_PRINT_U32 => {
                let line = format!("{}\n", wire_u32(data));
                self.emit(line.as_bytes());
            }
            PORT_PRINT_STR => {
                let addr = GuestAddr::from_wire(data);
                let s = mem.read_cstr(self.guest_phys(addr));
                trace!("{}: print string at {:#x} ({} bytes)", self.label, addr.0, s.len());
                self.emit(&s);
            }
            PORT_EXITS_BY_TYPE => {
                let addr = GuestAddr::from_wire(data);
                let snapshot = stats.snapshot();
                if let Err(e) = mem.write_cstr(self.guest_phys(addr), &snapshot) {
                    warn!("{}: exit snapshot at {:#x} not written: {}", self.label, addr.0, e);
                }
            }
            PORT_TRANSLATE => {
                self.translate_latch = GuestAddr::from_wire(data);
            }
            _ => {
                warn!("{}: out to unhandled port {:#x}, data {:02x?}", self.label, port, data);
            }
        }
    }

    fn emit(&mut self, bytes: &[u8]) {
        if let Err(e) = self.sink.write_all(bytes).and_then(|()| self.sink.flush()) {
            warn!("{}: guest output dropped ({} bytes): {}", self.label, bytes.len(), e);
        }
    }

    /// Guest `in`. Unknown ports read as all ones.
    pub fn io_in(&mut self, port: u16, data: &mut [u8], stats: &ExitStats) {
        let value = match port {
            PORT_EXIT_COUNT => stats.total as u32,
            PORT_TRANSLATE => self.translate_latch.translate(self.segment_base),
            PORT_EXITS_BY_TYPE => 0,
            _ => {
                warn!("{}: in from unhandled port {:#x}", self.label, port);
                data.fill(0xff);
                return;
            }
        };
        let bytes = value.to_le_bytes();
        let n = data.len().min(bytes.len());
        data[..n].copy_from_slice(&bytes[..n]);
        data[n..].fill(0);
    }
}
