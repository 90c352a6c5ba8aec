use crate::error::{Result, VMError};
use kvm_bindings::KVM_API_VERSION;
use kvm_ioctls::{Kvm, VmFd};
use log::{debug, info};


/// Process-wide handle on `/dev/kvm`, shared read-only by both VMs.
pub struct Hypervisor {
    kvm: Kvm,
}


impl Hypervisor {
    pub fn open() -> Result<Self> {
        let kvm = Kvm::new().map_err(VMError::DeviceOpen)?;
        let got = kvm.get_api_version();
        if got != KVM_API_VERSION as i32 {
            return Err(VMError::ApiVersion { got, expected: KVM_API_VERSION as i32 });
        }
        info!("opened /dev/kvm, api version {}", got);
        Ok(Self { kvm })
    }

    pub fn create_vm(&self) -> Result<VmFd> {
        self.kvm
            .create_vm()
            .map_err(|source| VMError::Setup { op: "KVM_CREATE_VM", source })
    }

    /// Size of the `kvm_run` exit-status area every vCPU shares with the kernel.
    pub fn vcpu_mmap_size(&self) -> Result<usize> {
        let size = self
            .kvm
            .get_vcpu_mmap_size()
            .map_err(|source| VMError::Setup { op: "KVM_GET_VCPU_MMAP_SIZE", source })?;
        debug!("kvm_run mapping is {} bytes", size);
        Ok(size)
    }
}
