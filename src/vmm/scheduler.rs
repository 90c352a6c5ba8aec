//! Weighted round-robin between exactly two guests.
//!
//! The current guest runs until `KVM_RUN` returns, its exit is handled, and
//! one timer tick has been consumed; that is one turn. After `weight` turns
//! the other guest becomes current. Over any whole number of cycles guest
//! A and guest B get `w_a : w_b` quanta, in the order A^w_a B^w_b.

use crate::error::{Result, VMError};
use crate::types::{Termination, VmSlot};
use super::event_loop::Flow;
use super::signals::VcpuSignalMask;
use log::{debug, info};


/// A schedulable guest: one VM with its single vCPU.
pub trait Guest {
    fn label(&self) -> &str;

    /// Put the vCPU back into its initial register state.
    fn reset(&mut self) -> Result<()>;

    fn set_signal_mask(&mut self, mask: &VcpuSignalMask) -> Result<()>;

    /// One blocking execution call followed by exit dispatch.
    fn run_once(&mut self) -> Result<Flow>;
}


/// Source of preemption ticks and owner of the signal discipline.
pub trait Preemption {
    /// Keep the tick signal pending between runs so it can be waited for.
    fn block(&mut self) -> Result<()>;

    /// Mask for vCPUs: everything blocked except the tick and SIGINT.
    fn vcpu_mask(&self) -> Result<VcpuSignalMask>;

    fn arm(&mut self) -> Result<()>;

    /// Block until exactly one tick has been consumed.
    fn wait_tick(&mut self) -> Result<()>;
}


#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedState {
    Setup,
    Running(VmSlot),
    Terminated,
}


struct Lane<G> {
    guest: G,
    weight: u32,
    /// Turns taken since this lane last became current.
    runs: u32,
    turns: u64,
}


pub struct Scheduler<G: Guest, P: Preemption> {
    lanes: [Lane<G>; 2],
    current: VmSlot,
    preempt: P,
    state: SchedState,
    max_turns: Option<u64>,
    turns: u64,
}


impl<G: Guest, P: Preemption> Scheduler<G, P> {
    pub fn new(guests: [G; 2], weights: [u32; 2], preempt: P, max_turns: Option<u64>) -> Result<Self> {
        if let Some(slot) = VmSlot::ALL.into_iter().find(|s| weights[s.index()] == 0) {
            return Err(VMError::VMConfiguration(format!("{} weight must be at least 1", slot)));
        }
        let [a, b] = guests;
        let lane = |guest, weight| Lane { guest, weight, runs: 0, turns: 0 };
        Ok(Self {
            lanes: [lane(a, weights[0]), lane(b, weights[1])],
            current: VmSlot::A,
            preempt,
            state: SchedState::Setup,
            max_turns,
            turns: 0,
        })
    }

    pub fn state(&self) -> SchedState {
        self.state
    }

    pub fn current(&self) -> VmSlot {
        self.current
    }

    pub fn runs(&self, slot: VmSlot) -> u32 {
        self.lanes[slot.index()].runs
    }

    pub fn turns(&self, slot: VmSlot) -> u64 {
        self.lanes[slot.index()].turns
    }

    pub fn weight(&self, slot: VmSlot) -> u32 {
        self.lanes[slot.index()].weight
    }

    pub fn guest(&self, slot: VmSlot) -> &G {
        &self.lanes[slot.index()].guest
    }

    pub fn preemption(&self) -> &P {
        &self.preempt
    }

    /// Reset both guests, establish the signal discipline and arm the timer.
    pub fn start(&mut self) -> Result<()> {
        if self.state != SchedState::Setup {
            return Err(VMError::VMConfiguration("scheduler already started".into()));
        }
        for lane in &mut self.lanes {
            lane.guest.reset()?;
            lane.runs = 0;
        }

        self.preempt.block()?;
        let mask = self.preempt.vcpu_mask()?;
        for lane in &mut self.lanes {
            lane.guest.set_signal_mask(&mask)?;
        }
        self.preempt.arm()?;

        info!(
            "scheduling {} (weight {}) and {} (weight {})",
            self.lanes[0].guest.label(),
            self.lanes[0].weight,
            self.lanes[1].guest.label(),
            self.lanes[1].weight
        );
        self.state = SchedState::Running(self.current);
        Ok(())
    }

    /// One turn of the current guest. Returns the termination cause once a
    /// guest halts or shuts down.
    pub fn step(&mut self) -> Result<Option<Termination>> {
        if !matches!(self.state, SchedState::Running(_)) {
            return Err(VMError::VMConfiguration(format!("cannot step in state {:?}", self.state)));
        }
        let slot = self.current;
        let lane = &mut self.lanes[slot.index()];
        debug!("{}: started running (run {} of {})", lane.guest.label(), lane.runs + 1, lane.weight);

        let flow = match lane.guest.run_once() {
            Ok(flow) => flow,
            Err(e) => {
                self.state = SchedState::Terminated;
                return Err(e);
            }
        };
        lane.runs += 1;
        lane.turns += 1;
        self.turns += 1;

        match flow {
            Flow::Continue => {}
            Flow::Halt => {
                self.state = SchedState::Terminated;
                return Ok(Some(Termination::Halt { vm: slot }));
            }
            Flow::Shutdown => {
                self.state = SchedState::Terminated;
                return Ok(Some(Termination::Shutdown { vm: slot }));
            }
        }

        if let Err(e) = self.preempt.wait_tick() {
            self.state = SchedState::Terminated;
            return Err(e);
        }

        if lane.runs == lane.weight {
            lane.runs = 0;
            self.current = slot.other();
            self.state = SchedState::Running(self.current);
            debug!("{} used its {} quanta, switching to {}", slot, lane.weight, self.current);
        }
        Ok(None)
    }

    pub fn run(&mut self) -> Result<Termination> {
        loop {
            if let Some(limit) = self.max_turns {
                if self.turns >= limit {
                    self.state = SchedState::Terminated;
                    info!("turn limit of {} reached", limit);
                    return Ok(Termination::TurnLimit { turns: self.turns });
                }
            }
            if let Some(done) = self.step()? {
                return Ok(done);
            }
        }
    }

    /// Hand the guests back for teardown; the preemption source is dropped here.
    pub fn into_guests(self) -> [G; 2] {
        let [a, b] = self.lanes;
        [a.guest, b.guest]
    }
}
