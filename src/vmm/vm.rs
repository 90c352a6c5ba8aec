use crate::error::{Result, VMError};
use crate::types::{ExitStats, FlatLayout, VmSlot};
use super::boot;
use super::devices::HypercallDevice;
use super::event_loop::{ExitDispatcher, Flow};
use super::kvm_ctx::Hypervisor;
use super::memory::GuestMem;
use super::scheduler::Guest;
use super::signals::VcpuSignalMask;
use super::vcpu::Vcpu;
use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use log::{debug, info};
use std::io::Write;
use std::path::Path;
use std::time::Duration;


/// One guest machine: VM fd, its RAM, its vCPUs and its hypercall state.
///
/// Field order is teardown order: vCPUs (fd + `kvm_run` mapping) go
/// first, then the VM fd, then guest memory.
pub struct Vm {
    vcpus: Vec<Vcpu>,
    fd: VmFd,
    memory: GuestMem,
    slot: VmSlot,
    layout: FlatLayout,
    device: HypercallDevice,
    dispatcher: ExitDispatcher,
    stats: ExitStats,
}


impl Vm {
    /// Create the VM and install `layout.memory_size` bytes of anonymous
    /// memory as slot 0 at guest-physical address 0.
    pub fn create(
        hv: &Hypervisor,
        slot: VmSlot,
        layout: FlatLayout,
        sink: Box<dyn Write + Send>,
        io_delay: Duration,
    ) -> Result<Self> {
        let fd = hv.create_vm()?;
        let memory = GuestMem::create(layout.memory_size)?;

        let region = kvm_userspace_memory_region {
            slot: 0,
            guest_phys_addr: 0,
            memory_size: memory.size() as u64,
            userspace_addr: memory.host_base()?,
            flags: 0,
        };
        // SAFETY: the region stays mapped for as long as the VM fd lives,
        // which field order guarantees.
        unsafe { fd.set_user_memory_region(region) }
            .map_err(|source| VMError::Setup { op: "KVM_SET_USER_MEMORY_REGION", source })?;
        info!("{}: {} bytes of guest memory at gpa 0", slot, memory.size());

        Ok(Self {
            vcpus: Vec::new(),
            fd,
            memory,
            slot,
            layout,
            device: HypercallDevice::new(slot.label(), layout.segment_base(), sink),
            dispatcher: ExitDispatcher::new(io_delay),
            stats: ExitStats::default(),
        })
    }

    pub fn slot(&self) -> VmSlot {
        self.slot
    }

    pub fn stats(&self) -> &ExitStats {
        &self.stats
    }

    pub fn vcpu(&self) -> Option<&Vcpu> {
        self.vcpus.first()
    }

    pub fn load_image(&self, path: &Path, load_addr: u64) -> Result<usize> {
        boot::load_image(&self.memory, path, load_addr)
    }

    pub fn create_vcpu(&mut self, hv: &Hypervisor, id: u64) -> Result<()> {
        let run_size = hv.vcpu_mmap_size()?;
        let vcpu = Vcpu::create(&self.fd, id, run_size)?;
        self.vcpus.push(vcpu);
        Ok(())
    }

    /// Release vCPUs, the VM fd and guest memory, in that order.
    pub fn destroy(self) {
        let Vm { vcpus, fd, memory, slot, stats, .. } = self;
        drop(vcpus);
        drop(fd);
        drop(memory);
        info!("{}: destroyed after {} exits", slot, stats.total);
    }
}


impl Guest for Vm {
    fn label(&self) -> &str {
        self.slot.label()
    }

    fn reset(&mut self) -> Result<()> {
        let layout = self.layout;
        for vcpu in &mut self.vcpus {
            vcpu.reset(&layout)?;
        }
        debug!("{}: vcpus reset", self.slot);
        Ok(())
    }

    fn set_signal_mask(&mut self, mask: &VcpuSignalMask) -> Result<()> {
        for vcpu in &self.vcpus {
            vcpu.set_signal_mask(mask)?;
        }
        Ok(())
    }

    fn run_once(&mut self) -> Result<Flow> {
        let label = self.slot.label();
        let Vm { vcpus, memory, device, dispatcher, stats, .. } = self;
        let vcpu = vcpus
            .first_mut()
            .ok_or_else(|| VMError::VMConfiguration(format!("{} has no vcpu", label)))?;
        let outcome = vcpu.run();
        dispatcher.dispatch(label, outcome, device, memory, stats)
    }
}
