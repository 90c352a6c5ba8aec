//! Host-side monitor that runs two flat-binary guests on one core, each in
//! its own KVM virtual machine, alternating them with a weighted round-robin
//! scheduler driven by a POSIX timer signal.

pub mod config;
pub mod error;
pub mod types;
pub mod vmm;


pub use config::{GuestConfig, VmmConfig};
pub use error::VMError;
pub use types::{RunSummary, Termination, VmSlot};
pub use vmm::run::{run_vmm, run_vmm_with_output};
