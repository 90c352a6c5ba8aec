use crate::error::{Result, VMError};
use crate::types::{FlatLayout, VmSlot};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MEMORY_SIZE: usize = 512_000_000;
pub const DEFAULT_CODE_START: u16 = 0x1000;
pub const DEFAULT_QUANTUM_US: u64 = 1_000_000;
pub const DEFAULT_WEIGHTS: [u32; 2] = [7, 3];
pub const DEFAULT_IMAGES: [&str; 2] = ["guest1.bin", "guest2.bin"];

/// One guest: its flat image and its share of the CPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestConfig {
    pub image: PathBuf,
    /// Quanta the guest keeps the CPU before the other guest gets it.
    pub weight: u32,
}

/// Main configuration for the two-guest monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmmConfig {
    /// Guest RAM per VM (bytes)
    pub memory_size: usize,
    /// Real-mode segment for every segment register; base = code_start * 16
    pub code_start: u16,
    /// Timer period (microseconds)
    pub quantum_us: u64,
    /// Slot A first, then slot B
    pub guests: [GuestConfig; 2],
    /// Guest-physical address each image is copied to
    pub image_load_addr: u64,
    /// Pause after every port I/O exit (ms)
    pub io_delay_ms: u64,
    /// Stop after this many scheduler turns
    pub max_turns: Option<u64>,
    /// Signal the timer raises to preempt the running guest
    pub preempt_signal: i32,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            code_start: DEFAULT_CODE_START,
            quantum_us: DEFAULT_QUANTUM_US,
            guests: [
                GuestConfig { image: PathBuf::from(DEFAULT_IMAGES[0]), weight: DEFAULT_WEIGHTS[0] },
                GuestConfig { image: PathBuf::from(DEFAULT_IMAGES[1]), weight: DEFAULT_WEIGHTS[1] },
            ],
            image_load_addr: 0,
            io_delay_ms: 0,
            max_turns: None,
            preempt_signal: libc::SIGIO,
        }
    }
}

impl VmmConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: VmmConfig = serde_json::from_str(&raw)
            .map_err(|e| VMError::VMConfiguration(format!("{}: {}", path.display(), e)))?;
        Ok(cfg)
    }

    pub fn guest(&self, slot: VmSlot) -> &GuestConfig {
        &self.guests[slot.index()]
    }

    pub fn layout(&self) -> FlatLayout {
        FlatLayout { code_start: self.code_start, memory_size: self.memory_size }
    }

    pub fn quantum(&self) -> Duration {
        Duration::from_micros(self.quantum_us)
    }

    pub fn io_delay(&self) -> Duration {
        Duration::from_millis(self.io_delay_ms)
    }

    pub fn weights(&self) -> [u32; 2] {
        [self.guests[0].weight, self.guests[1].weight]
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(VMError::VMConfiguration(msg));
        if self.memory_size == 0 {
            return bad("memory_size must be positive".into());
        }
        if self.layout().segment_base() >= self.memory_size as u64 {
            return bad(format!(
                "code segment base {:#x} lies outside {} bytes of guest memory",
                self.layout().segment_base(),
                self.memory_size
            ));
        }
        if self.image_load_addr >= self.memory_size as u64 {
            return bad(format!("image_load_addr {:#x} is outside guest memory", self.image_load_addr));
        }
        if self.quantum_us == 0 {
            return bad("quantum_us must be positive".into());
        }
        for slot in VmSlot::ALL {
            if self.guest(slot).weight == 0 {
                return bad(format!("{} weight must be at least 1", slot));
            }
        }
        if self.preempt_signal == libc::SIGINT || self.preempt_signal <= 0 {
            return bad(format!("{} cannot be the preemption signal", self.preempt_signal));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_setup() {
        let cfg = VmmConfig::default();
        assert_eq!(cfg.weights(), [7, 3]);
        assert_eq!(cfg.quantum(), Duration::from_secs(1));
        assert_eq!(cfg.layout().segment_base(), 0x10000);
        assert_eq!(cfg.preempt_signal, libc::SIGIO);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"quantum_us": 100000, "guests": [{{"image": "a.bin", "weight": 2}}, {{"image": "b.bin", "weight": 5}}]}}"#
        )
        .unwrap();
        let cfg = VmmConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.quantum(), Duration::from_millis(100));
        assert_eq!(cfg.weights(), [2, 5]);
        assert_eq!(cfg.guest(VmSlot::B).image, PathBuf::from("b.bin"));
        assert_eq!(cfg.memory_size, DEFAULT_MEMORY_SIZE);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"quantum": 5}}"#).unwrap();
        assert!(matches!(VmmConfig::from_file(file.path()), Err(VMError::VMConfiguration(_))));
    }

    #[test]
    fn zero_weight_is_invalid() {
        let mut cfg = VmmConfig::default();
        cfg.guests[1].weight = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn segment_base_must_fit_memory() {
        let cfg = VmmConfig { memory_size: 0x8000, ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sigint_stays_reserved() {
        let cfg = VmmConfig { preempt_signal: libc::SIGINT, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
