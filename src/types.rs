use serde::{Deserialize, Serialize};
use std::fmt;


/// One of the two scheduling slots. Slot `A` always runs first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmSlot {
    A,
    B,
}

impl VmSlot {
    pub const ALL: [VmSlot; 2] = [VmSlot::A, VmSlot::B];

    pub fn index(self) -> usize {
        match self {
            VmSlot::A => 0,
            VmSlot::B => 1,
        }
    }

    pub fn other(self) -> Self {
        match self {
            VmSlot::A => VmSlot::B,
            VmSlot::B => VmSlot::A,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VmSlot::A => "vm-a",
            VmSlot::B => "vm-b",
        }
    }
}

impl fmt::Display for VmSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}


/// A guest virtual address as it crosses the hypercall boundary.
///
/// The guest sends pointers as their distance from null, truncated to 32
/// bits. This is deliberately not a host pointer; it only becomes a guest
/// physical address through [`GuestAddr::translate`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestAddr(pub u32);

impl GuestAddr {
    /// Decode the little-endian port payload. Short payloads are zero-extended.
    pub fn from_wire(data: &[u8]) -> Self {
        let mut raw = [0u8; 4];
        let n = data.len().min(4);
        raw[..n].copy_from_slice(&data[..n]);
        GuestAddr(u32::from_le_bytes(raw))
    }

    /// Host-relative offset under the flat real-mode model: `base + v`,
    /// wrapping at 32 bits like the wire field it is returned in.
    pub fn translate(self, segment_base: u64) -> u32 {
        (segment_base as u32).wrapping_add(self.0)
    }
}


/// Flat addressing model shared by every segment register of a guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlatLayout {
    /// Real-mode segment selector loaded into cs/ds/es/fs/gs/ss.
    pub code_start: u16,
    pub memory_size: usize,
}

/// Bytes kept free above the initial stack pointer.
pub const STACK_RESERVE: u64 = 0x10;

impl FlatLayout {
    pub fn segment_base(&self) -> u64 {
        u64::from(self.code_start) * 16
    }

    /// Initial rsp, relative to the stack segment base.
    pub fn stack_pointer(&self) -> u64 {
        let top = (self.memory_size as u64).saturating_sub(self.segment_base());
        top.saturating_sub(STACK_RESERVE) & !0xf
    }
}


/// Per-VM trap counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStats {
    pub total: u64,
    pub io: u64,
    pub halt: u64,
    pub shutdown: u64,
    pub mmio: u64,
    pub debug: u64,
    pub interrupt: u64,
}

impl ExitStats {
    /// Text handed back to the guest on the exit-count-by-type port.
    pub fn snapshot(&self) -> String {
        format!(
            "IO: {} HLT: {} SHUTDOWN: {} MMIO: {} DEBUG: {} INTR: {} TOTAL: {}\n",
            self.io, self.halt, self.shutdown, self.mmio, self.debug, self.interrupt, self.total
        )
    }
}


/// Why the scheduler loop stopped without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    Halt { vm: VmSlot },
    Shutdown { vm: VmSlot },
    TurnLimit { turns: u64 },
}


#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VmReport {
    pub vm: VmSlot,
    pub weight: u32,
    /// Scheduler turns spent as the current VM.
    pub turns: u64,
    pub exits: ExitStats,
}


#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub termination: Termination,
    pub vms: Vec<VmReport>,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_matches_flat_real_mode() {
        let layout = FlatLayout { code_start: 0x1000, memory_size: 512_000_000 };
        assert_eq!(layout.segment_base(), 0x10000);
        assert_eq!(GuestAddr(1024).translate(layout.segment_base()), 0x10400);
    }

    #[test]
    fn translate_wraps_at_32_bits() {
        // 0x10000 + 0xffff_ffff does not fit the 4-byte reply; the carry is lost.
        assert_eq!(GuestAddr(u32::MAX).translate(0x10000), 0xffff);
    }

    #[test]
    fn wire_address_is_little_endian_and_zero_extended() {
        assert_eq!(GuestAddr::from_wire(&[0x00, 0x04, 0x00, 0x00]), GuestAddr(1024));
        assert_eq!(GuestAddr::from_wire(&[0x34, 0x12]), GuestAddr(0x1234));
        assert_eq!(GuestAddr::from_wire(&[1, 0, 0, 0, 0xff]), GuestAddr(1));
    }

    #[test]
    fn stack_pointer_sits_below_top_of_memory() {
        let layout = FlatLayout { code_start: 0x1000, memory_size: 0x20000 };
        assert_eq!(layout.stack_pointer(), 0x10000 - STACK_RESERVE);
        let tiny = FlatLayout { code_start: 0x1000, memory_size: 0x100 };
        assert_eq!(tiny.stack_pointer(), 0);
    }

    #[test]
    fn slots_alternate() {
        assert_eq!(VmSlot::A.other(), VmSlot::B);
        assert_eq!(VmSlot::B.other().other(), VmSlot::B);
        assert_eq!(VmSlot::B.index(), 1);
    }

    #[test]
    fn summary_serializes_termination_tag() {
        let json = serde_json::to_string(&Termination::Shutdown { vm: VmSlot::B }).unwrap();
        assert_eq!(json, r#"{"kind":"shutdown","vm":"B"}"#);
    }
}
