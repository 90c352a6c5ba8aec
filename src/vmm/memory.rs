use crate::error::{Result, VMError};
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

/// Longest string a hypercall may ask the host to read out of the guest.
pub const MAX_GUEST_STR: usize = 4096;


/// The whole guest-physical address space of one VM: a single anonymous
/// region starting at address 0.
pub struct GuestMem {
    pub mem: GuestMemoryMmap,
    size: usize,
}


impl GuestMem {
    pub fn create(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(VMError::Memory("guest memory size must be positive".into()));
        }
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size)])
            .map_err(|e| VMError::Memory(format!("cannot map {} bytes: {}", size, e)))?;
        Ok(Self { mem, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Host address of guest-physical 0, for `KVM_SET_USER_MEMORY_REGION`.
    pub fn host_base(&self) -> Result<u64> {
        let ptr = self.mem.get_host_address(GuestAddress(0))?;
        Ok(ptr as u64)
    }

    /// Copy `bytes` verbatim starting at `addr`, refusing anything that would
    /// run past the end of the region.
    pub fn load(&self, addr: u64, bytes: &[u8]) -> Result<()> {
        let capacity = self.capacity_from(addr);
        if bytes.len() > capacity {
            return Err(VMError::Memory(format!(
                "{} bytes at {:#x} overrun {} bytes of guest memory",
                bytes.len(),
                addr,
                self.size
            )));
        }
        self.mem.write_slice(bytes, GuestAddress(addr))?;
        Ok(())
    }

    /// Bytes available from `addr` to the end of guest memory.
    pub fn capacity_from(&self, addr: u64) -> usize {
        (self.size as u64).saturating_sub(addr) as usize
    }

    /// Read a NUL-terminated string. Stops at the terminator, the end of
    /// guest memory, or [`MAX_GUEST_STR`] bytes, whichever comes first.
    pub fn read_cstr(&self, addr: u64) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..MAX_GUEST_STR as u64 {
            let byte: u8 = match self.mem.read_obj(GuestAddress(addr.wrapping_add(i))) {
                Ok(b) => b,
                Err(_) => break,
            };
            if byte == 0 {
                break;
            }
            out.push(byte);
        }
        out
    }

    /// Write `s` plus a terminating NUL at `addr`.
    pub fn write_cstr(&self, addr: u64, s: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.load(addr, &bytes)
    }
}
