//! Preemption plumbing: the timer signal is kept blocked on the scheduler
//! thread and consumed with `sigwait`, except while the thread sits inside
//! `KVM_RUN`, where the per-vCPU mask lets it through to kick the guest out.

use crate::error::{Result, VMError};
use super::scheduler::Preemption;
use libc::{c_int, sigset_t};
use log::{debug, trace};
use std::io;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::time::Duration;
use vmm_sys_util::signal::{block_signal, create_sigset, get_blocked_signals};

/// KVM takes the kernel's sigset, not libc's much larger `sigset_t`.
pub const KERNEL_SIGSET_BYTES: usize = 8;


/// Signal mask installed on a vCPU with `KVM_SET_SIGNAL_MASK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VcpuSignalMask {
    bytes: [u8; KERNEL_SIGSET_BYTES],
}

impl VcpuSignalMask {
    /// Block every signal except `allowed`.
    pub fn allowing(allowed: &[c_int]) -> Result<Self> {
        let mut set = MaybeUninit::<sigset_t>::uninit();
        // SAFETY: sigfillset initialises the whole set.
        if unsafe { libc::sigfillset(set.as_mut_ptr()) } < 0 {
            return Err(VMError::SignalDiscipline(io::Error::last_os_error().to_string()));
        }
        // SAFETY: initialised above.
        let mut set = unsafe { set.assume_init() };
        for &sig in allowed {
            // SAFETY: set is a valid sigset_t.
            if unsafe { libc::sigdelset(&mut set, sig) } < 0 {
                return Err(VMError::SignalDiscipline(format!("invalid signal {}", sig)));
            }
        }
        for &sig in allowed {
            // SAFETY: set is a valid sigset_t.
            if unsafe { libc::sigismember(&set, sig) } != 0 {
                return Err(VMError::SignalDiscipline(format!(
                    "signal {} still blocked in the vCPU mask",
                    sig
                )));
            }
        }

        let mut bytes = [0u8; KERNEL_SIGSET_BYTES];
        // SAFETY: sigset_t is a plain bitmap of at least KERNEL_SIGSET_BYTES bytes.
        let raw = unsafe {
            std::slice::from_raw_parts(&set as *const sigset_t as *const u8, mem::size_of::<sigset_t>())
        };
        bytes.copy_from_slice(&raw[..KERNEL_SIGSET_BYTES]);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KERNEL_SIGSET_BYTES] {
        &self.bytes
    }

    pub fn blocks(&self, sig: c_int) -> bool {
        let bit = (sig - 1) as usize;
        bit < KERNEL_SIGSET_BYTES * 8 && self.bytes[bit / 8] & (1 << (bit % 8)) != 0
    }
}


/// Block `signal` on the calling thread so it stays pending until
/// `sigwait`ed, then confirm it really is in the blocked set.
pub fn block_for_sync_wait(signal: c_int) -> Result<()> {
    let discipline = |e: vmm_sys_util::signal::Error| VMError::SignalDiscipline(e.to_string());
    if !get_blocked_signals().map_err(discipline)?.contains(&signal) {
        block_signal(signal).map_err(discipline)?;
    }
    if !get_blocked_signals().map_err(discipline)?.contains(&signal) {
        return Err(VMError::SignalDiscipline(format!("signal {} is not blocked", signal)));
    }
    debug!("signal {} blocked for synchronous wait", signal);
    Ok(())
}


fn gettid() -> libc::pid_t {
    // SAFETY: gettid has no arguments and cannot fail.
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}


/// Periodic POSIX timer whose expiry raises `signal` on the thread that
/// armed it, so exactly one consumer ever sees the tick.
pub struct PreemptionTimer {
    signal: c_int,
    quantum: Duration,
    timer: Option<libc::timer_t>,
    ticks: u64,
}

impl PreemptionTimer {
    pub fn new(signal: c_int, quantum: Duration) -> Self {
        Self { signal, quantum, timer: None, ticks: 0 }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    fn period(&self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.quantum.as_secs() as libc::time_t,
            tv_nsec: self.quantum.subsec_nanos() as libc::c_long,
        }
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            // SAFETY: timer came from timer_create and is deleted once.
            unsafe { libc::timer_delete(timer) };
            debug!("preemption timer deleted after {} ticks", self.ticks);
        }
    }
}

impl Preemption for PreemptionTimer {
    fn block(&mut self) -> Result<()> {
        block_for_sync_wait(self.signal)
    }

    fn vcpu_mask(&self) -> Result<VcpuSignalMask> {
        VcpuSignalMask::allowing(&[self.signal, libc::SIGINT])
    }

    fn arm(&mut self) -> Result<()> {
        if self.timer.is_some() {
            return Ok(());
        }
        // SAFETY: all-zero is a valid sigevent.
        let mut sev: libc::sigevent = unsafe { mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = self.signal;
        sev.sigev_notify_thread_id = gettid();

        let mut timer: libc::timer_t = ptr::null_mut();
        // SAFETY: sev and timer are valid for the duration of the call.
        if unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut timer) } < 0 {
            return Err(VMError::Timer(io::Error::last_os_error()));
        }
        self.timer = Some(timer);

        let spec = libc::itimerspec { it_interval: self.period(), it_value: self.period() };
        // SAFETY: timer is live; spec outlives the call.
        if unsafe { libc::timer_settime(timer, 0, &spec, ptr::null_mut()) } < 0 {
            let err = io::Error::last_os_error();
            self.disarm();
            return Err(VMError::Timer(err));
        }
        debug!("preemption timer armed: signal {} every {:?}", self.signal, self.quantum);
        Ok(())
    }

    fn wait_tick(&mut self) -> Result<()> {
        let set = create_sigset(&[self.signal])
            .map_err(|e| VMError::SignalDiscipline(e.to_string()))?;
        let mut sig: c_int = 0;
        // SAFETY: set and sig are valid; sigwait returns an error number.
        let ret = unsafe { libc::sigwait(&set, &mut sig) };
        if ret != 0 {
            return Err(VMError::Timer(io::Error::from_raw_os_error(ret)));
        }
        self.ticks += 1;
        trace!("tick {} (signal {})", self.ticks, sig);
        Ok(())
    }
}

impl Drop for PreemptionTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcpu_mask_lets_only_preemption_and_interrupt_through() {
        let mask = VcpuSignalMask::allowing(&[libc::SIGIO, libc::SIGINT]).unwrap();
        assert!(!mask.blocks(libc::SIGIO));
        assert!(!mask.blocks(libc::SIGINT));
        assert!(mask.blocks(libc::SIGTERM));
        assert!(mask.blocks(libc::SIGUSR1));
        assert!(mask.blocks(libc::SIGALRM));
    }

    #[test]
    fn vcpu_mask_is_kernel_sized() {
        let mask = VcpuSignalMask::allowing(&[libc::SIGIO]).unwrap();
        assert_eq!(mask.as_bytes().len(), 8);
        // SIGIO is 29: byte 3, bit 4.
        assert_eq!(mask.as_bytes()[3] & (1 << 4), 0);
    }

    #[test]
    fn bogus_signal_is_a_discipline_violation() {
        assert!(matches!(
            VcpuSignalMask::allowing(&[0]),
            Err(VMError::SignalDiscipline(_))
        ));
    }

    #[test]
    fn timer_ticks_are_consumed_synchronously() {
        // SIGWINCH is ignored by default, so a stray delivery cannot kill the test binary.
        let mut timer = PreemptionTimer::new(libc::SIGWINCH, Duration::from_millis(5));
        timer.block().unwrap();
        timer.block().unwrap();
        timer.arm().unwrap();
        timer.wait_tick().unwrap();
        timer.wait_tick().unwrap();
        assert_eq!(timer.ticks(), 2);
        drop(timer);
    }
}
