use crate::error::{Result, VMError};
use crate::types::FlatLayout;
use super::signals::{VcpuSignalMask, KERNEL_SIGSET_BYTES};
use kvm_bindings::{kvm_regs, kvm_segment, kvm_signal_mask, kvm_sregs, KVMIO};
use kvm_ioctls::{VcpuExit as KvmExit, VcpuFd, VmFd};
use log::debug;
use vmm_sys_util::ioctl::ioctl_with_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

/// Bit 1 of RFLAGS is reserved and must read as one.
pub const RFLAGS_RESERVED: u64 = 0x2;

ioctl_iow_nr!(KVM_SET_SIGNAL_MASK, KVMIO, 0x8b, kvm_signal_mask);

/// `struct kvm_signal_mask` with its flexible array sized for the kernel sigset.
#[repr(C)]
struct KvmSignalMask {
    len: u32,
    sigset: [u8; KERNEL_SIGSET_BYTES],
}


/// Why `KVM_RUN` handed control back. Port and MMIO payloads borrow the
/// `kvm_run` page, so an exit must be handled before the vCPU runs again.
#[derive(Debug)]
pub enum GuestExit<'a> {
    IoOut { port: u16, data: &'a [u8] },
    IoIn { port: u16, data: &'a mut [u8] },
    MmioRead { addr: u64, data: &'a mut [u8] },
    MmioWrite { addr: u64, data: &'a [u8] },
    Halt,
    Shutdown,
    Debug,
    Interrupt,
    Unrecognized(String),
}

/// Result of one blocking execution call.
#[derive(Debug)]
pub enum RunOutcome<'a> {
    Completed(GuestExit<'a>),
    /// A signal unblocked by the vCPU mask cut `KVM_RUN` short.
    Interrupted,
    Failed(kvm_ioctls::Error),
}


pub struct Vcpu {
    fd: VcpuFd,
}


impl Vcpu {
    /// Create vCPU `id`. kvm-ioctls maps the shared `kvm_run` area of
    /// `run_size` bytes alongside the fd and unmaps it on drop.
    pub fn create(vm: &VmFd, id: u64, run_size: usize) -> Result<Self> {
        let fd = vm
            .create_vcpu(id)
            .map_err(|source| VMError::Setup { op: "KVM_CREATE_VCPU", source })?;
        debug!("vcpu {} created, kvm_run mapped ({} bytes)", id, run_size);
        Ok(Self { fd })
    }

    /// Program the flat real-mode state: every segment at the code base,
    /// rip = 0, stack near the top of guest memory.
    pub fn reset(&mut self, layout: &FlatLayout) -> Result<()> {
        let mut sregs = self
            .fd
            .get_sregs()
            .map_err(|source| VMError::Setup { op: "KVM_GET_SREGS", source })?;
        apply_flat_segments(&mut sregs, layout);
        self.fd
            .set_sregs(&sregs)
            .map_err(|source| VMError::Setup { op: "KVM_SET_SREGS", source })?;

        self.fd
            .set_regs(&initial_regs(layout))
            .map_err(|source| VMError::Setup { op: "KVM_SET_REGS", source })?;
        Ok(())
    }

    pub fn regs(&self) -> Result<(kvm_regs, kvm_sregs)> {
        let regs = self
            .fd
            .get_regs()
            .map_err(|source| VMError::Setup { op: "KVM_GET_REGS", source })?;
        let sregs = self
            .fd
            .get_sregs()
            .map_err(|source| VMError::Setup { op: "KVM_GET_SREGS", source })?;
        Ok((regs, sregs))
    }

    /// Replace the signal mask the kernel applies while this vCPU is in `KVM_RUN`.
    pub fn set_signal_mask(&self, mask: &VcpuSignalMask) -> Result<()> {
        let arg = KvmSignalMask { len: KERNEL_SIGSET_BYTES as u32, sigset: *mask.as_bytes() };
        // SAFETY: arg is a correctly laid out kvm_signal_mask that outlives the call.
        let ret = unsafe { ioctl_with_ref(&self.fd, KVM_SET_SIGNAL_MASK(), &arg) };
        if ret < 0 {
            return Err(VMError::Setup {
                op: "KVM_SET_SIGNAL_MASK",
                source: kvm_ioctls::Error::last(),
            });
        }
        Ok(())
    }

    /// Enter the guest. Blocks until it exits or a permitted signal arrives.
    pub fn run(&mut self) -> RunOutcome<'_> {
        match self.fd.run() {
            Ok(exit) => RunOutcome::Completed(match exit {
                KvmExit::IoOut(port, data) => GuestExit::IoOut { port, data },
                KvmExit::IoIn(port, data) => GuestExit::IoIn { port, data },
                KvmExit::MmioRead(addr, data) => GuestExit::MmioRead { addr, data },
                KvmExit::MmioWrite(addr, data) => GuestExit::MmioWrite { addr, data },
                KvmExit::Hlt => GuestExit::Halt,
                KvmExit::Shutdown => GuestExit::Shutdown,
                KvmExit::Debug(_) => GuestExit::Debug,
                KvmExit::Intr => GuestExit::Interrupt,
                other => GuestExit::Unrecognized(format!("{:?}", other)),
            }),
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => RunOutcome::Interrupted,
            Err(e) => RunOutcome::Failed(e),
        }
    }
}


fn flat_segment(seg: &mut kvm_segment, layout: &FlatLayout) {
    seg.selector = layout.code_start;
    seg.base = layout.segment_base();
}

/// Point cs/ds/es/fs/gs/ss at the one flat segment.
pub fn apply_flat_segments(sregs: &mut kvm_sregs, layout: &FlatLayout) {
    for seg in [
        &mut sregs.cs,
        &mut sregs.ds,
        &mut sregs.es,
        &mut sregs.fs,
        &mut sregs.gs,
        &mut sregs.ss,
    ] {
        flat_segment(seg, layout);
    }
}

pub fn initial_regs(layout: &FlatLayout) -> kvm_regs {
    kvm_regs {
        rflags: RFLAGS_RESERVED,
        rip: 0,
        rsp: layout.stack_pointer(),
        rbp: 0,
        ..Default::default()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FlatLayout {
        FlatLayout { code_start: 0x1000, memory_size: 512_000_000 }
    }

    #[test]
    fn every_segment_shares_the_code_base() {
        let mut sregs = kvm_sregs::default();
        apply_flat_segments(&mut sregs, &layout());
        for seg in [sregs.cs, sregs.ds, sregs.es, sregs.fs, sregs.gs, sregs.ss] {
            assert_eq!(seg.selector, 0x1000);
            assert_eq!(seg.base, 0x10000);
        }
    }

    #[test]
    fn flat_segments_are_idempotent() {
        let mut once = kvm_sregs::default();
        once.cs.limit = 0xffff;
        apply_flat_segments(&mut once, &layout());
        let mut twice = once;
        apply_flat_segments(&mut twice, &layout());
        assert_eq!(once, twice);
        assert_eq!(twice.cs.limit, 0xffff);
    }

    #[test]
    fn initial_regs_follow_the_flat_model() {
        let regs = initial_regs(&layout());
        assert_eq!(regs.rip, 0);
        assert_eq!(regs.rbp, 0);
        assert_eq!(regs.rflags & RFLAGS_RESERVED, RFLAGS_RESERVED);
        assert_eq!(regs.rsp, layout().stack_pointer());
        assert_eq!(initial_regs(&layout()), regs);
    }

    #[test]
    fn signal_mask_ioctl_number() {
        // _IOW(KVMIO, 0x8b, struct kvm_signal_mask) with a 4-byte header.
        assert_eq!(KVM_SET_SIGNAL_MASK(), 0x4004_ae8b);
        assert_eq!(std::mem::size_of::<KvmSignalMask>(), 12);
    }
}
