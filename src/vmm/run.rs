use crate::config::VmmConfig;
use crate::error::Result;
use crate::types::{RunSummary, VmReport, VmSlot};
use super::kvm_ctx::Hypervisor;
use super::scheduler::Scheduler;
use super::signals::PreemptionTimer;
use super::vm::Vm;
use log::info;
use std::io::Write;


/// Run both guests to completion with their output on stdout.
pub fn run_vmm(cfg: &VmmConfig) -> Result<RunSummary> {
    run_vmm_with_output(cfg, |_| Box::new(std::io::stdout()))
}


pub fn run_vmm_with_output<F>(cfg: &VmmConfig, mut sink_for: F) -> Result<RunSummary>
where
    F: FnMut(VmSlot) -> Box<dyn Write + Send>,
{
    cfg.validate()?;

    // 1) /dev/kvm + both machines
    let hv = Hypervisor::open()?;
    let a = setup_vm(&hv, cfg, VmSlot::A, sink_for(VmSlot::A))?;
    let b = setup_vm(&hv, cfg, VmSlot::B, sink_for(VmSlot::B))?;

    // 2) signal discipline + timer, then alternate until a guest stops
    let timer = PreemptionTimer::new(cfg.preempt_signal, cfg.quantum());
    let mut sched = Scheduler::new([a, b], cfg.weights(), timer, cfg.max_turns)?;
    let outcome = sched.start().and_then(|()| sched.run());
    let turns = VmSlot::ALL.map(|slot| sched.turns(slot));

    // 3) teardown, whatever the outcome
    let guests = sched.into_guests();
    let vms = guests
        .iter()
        .map(|vm| VmReport {
            vm: vm.slot(),
            weight: cfg.guest(vm.slot()).weight,
            turns: turns[vm.slot().index()],
            exits: vm.stats().clone(),
        })
        .collect();
    for vm in guests {
        vm.destroy();
    }

    let termination = outcome?;
    info!("scheduler stopped: {:?}", termination);
    Ok(RunSummary { termination, vms })
}


fn setup_vm(hv: &Hypervisor, cfg: &VmmConfig, slot: VmSlot, sink: Box<dyn Write + Send>) -> Result<Vm> {
    let mut vm = Vm::create(hv, slot, cfg.layout(), sink, cfg.io_delay())?;
    vm.load_image(&cfg.guest(slot).image, cfg.image_load_addr)?;
    vm.create_vcpu(hv, 0)?;
    Ok(vm)
}
