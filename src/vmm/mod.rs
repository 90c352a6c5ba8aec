pub mod kvm_ctx;
pub mod memory;
pub mod boot;
pub mod vcpu;
pub mod vm;
pub mod devices;
pub mod event_loop;
pub mod signals;
pub mod scheduler;
pub mod run;
