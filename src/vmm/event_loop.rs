use crate::error::{Result, VMError};
use crate::types::ExitStats;
use super::devices::HypercallDevice;
use super::memory::GuestMem;
use super::vcpu::{GuestExit, RunOutcome};
use log::{debug, error, info};
use std::time::Duration;


/// What the scheduler should do after an exit has been handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt,
    Shutdown,
}

impl Flow {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Flow::Continue)
    }
}


/// Turns one `KVM_RUN` return into host-side work.
pub struct ExitDispatcher {
    /// Pause after port I/O, standing in for slow host-side servicing.
    pub io_delay: Duration,
}


impl ExitDispatcher {
    pub fn new(io_delay: Duration) -> Self {
        Self { io_delay }
    }

    pub fn dispatch(
        &self,
        label: &str,
        outcome: RunOutcome<'_>,
        device: &mut HypercallDevice,
        mem: &GuestMem,
        stats: &mut ExitStats,
    ) -> Result<Flow> {
        let exit = match outcome {
            RunOutcome::Completed(exit) => exit,
            RunOutcome::Interrupted => {
                stats.total += 1;
                stats.interrupt += 1;
                debug!("{}: interrupted by preemption signal", label);
                return Ok(Flow::Continue);
            }
            RunOutcome::Failed(source) => {
                error!("{}: KVM_RUN failed: {}", label, source);
                return Err(VMError::Execution { vm: label.to_string(), source });
            }
        };

        stats.total += 1;
        match exit {
            GuestExit::IoOut { port, data } => {
                stats.io += 1;
                debug!("{}: io out port {:#x}, data {:02x?}", label, port, data);
                device.io_out(port, data, mem, stats);
                self.pause();
            }
            GuestExit::IoIn { port, data } => {
                stats.io += 1;
                device.io_in(port, data, stats);
                debug!("{}: io in port {:#x}, data {:02x?}", label, port, data);
                self.pause();
            }
            GuestExit::MmioRead { addr, data } => {
                stats.mmio += 1;
                debug!("{}: mmio read {:#x} ({} bytes)", label, addr, data.len());
                data.fill(0);
            }
            GuestExit::MmioWrite { addr, data } => {
                stats.mmio += 1;
                debug!("{}: mmio write {:#x}: {:02x?}", label, addr, data);
            }
            GuestExit::Debug => {
                stats.debug += 1;
                debug!("{}: debug exit", label);
            }
            GuestExit::Interrupt => {
                stats.interrupt += 1;
                debug!("{}: interrupt exit", label);
            }
            GuestExit::Halt => {
                stats.halt += 1;
                info!("{}: guest halted", label);
                return Ok(Flow::Halt);
            }
            GuestExit::Shutdown => {
                stats.shutdown += 1;
                info!("{}: guest shut down", label);
                return Ok(Flow::Shutdown);
            }
            GuestExit::Unrecognized(reason) => {
                error!("{}: unrecognized exit reason {}", label, reason);
                return Err(VMError::UnrecognizedExit { vm: label.to_string(), reason });
            }
        }
        Ok(Flow::Continue)
    }

    fn pause(&self) {
        if !self.io_delay.is_zero() {
            std::thread::sleep(self.io_delay);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::devices::tests::SharedSink;
    use crate::vmm::devices::{PORT_EXIT_COUNT, PORT_PRINT_BYTE, PORT_PRINT_STR, PORT_PRINT_U32};
    use std::io::{self, Write};

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
        fn flush(&mut self) -> io::Result<()> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
    }

    struct Fixture {
        dispatcher: ExitDispatcher,
        device: HypercallDevice,
        mem: GuestMem,
        stats: ExitStats,
        sink: SharedSink,
    }

    impl Fixture {
        fn new() -> Self {
            let sink = SharedSink::default();
            Self {
                dispatcher: ExitDispatcher::new(Duration::ZERO),
                device: HypercallDevice::new("vm-a", 0x10000, Box::new(sink.clone())),
                mem: GuestMem::create(0x20000).unwrap(),
                stats: ExitStats::default(),
                sink,
            }
        }

        fn dispatch(&mut self, outcome: RunOutcome<'_>) -> Result<Flow> {
            self.dispatcher.dispatch("vm-a", outcome, &mut self.device, &self.mem, &mut self.stats)
        }
    }

    #[test]
    fn port_output_continues() {
        let mut fx = Fixture::new();
        let flow = fx
            .dispatch(RunOutcome::Completed(GuestExit::IoOut { port: PORT_PRINT_BYTE, data: b"H" }))
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(fx.sink.text(), "H");
        assert_eq!(fx.stats.io, 1);
        assert_eq!(fx.stats.total, 1);
    }

    #[test]
    fn broken_output_stream_is_not_fatal() {
        let mut fx = Fixture::new();
        fx.device = HypercallDevice::new("vm-a", 0x10000, Box::new(BrokenPipe));
        for port in [PORT_PRINT_BYTE, PORT_PRINT_U32, PORT_PRINT_STR] {
            let flow = fx
                .dispatch(RunOutcome::Completed(GuestExit::IoOut { port, data: b"H\0\0\0" }))
                .unwrap();
            assert_eq!(flow, Flow::Continue);
        }
        assert_eq!(fx.stats.io, 3);
        assert_eq!(fx.stats.total, 3);
    }

    #[test]
    fn exit_count_includes_the_reading_exit() {
        let mut fx = Fixture::new();
        fx.dispatch(RunOutcome::Interrupted).unwrap();
        let mut data = [0u8; 4];
        fx.dispatch(RunOutcome::Completed(GuestExit::IoIn { port: PORT_EXIT_COUNT, data: &mut data }))
            .unwrap();
        assert_eq!(u32::from_le_bytes(data), 2);
    }

    #[test]
    fn halt_and_shutdown_terminate() {
        let mut fx = Fixture::new();
        assert_eq!(fx.dispatch(RunOutcome::Completed(GuestExit::Halt)).unwrap(), Flow::Halt);
        assert_eq!(fx.dispatch(RunOutcome::Completed(GuestExit::Shutdown)).unwrap(), Flow::Shutdown);
        assert!(Flow::Halt.is_terminal() && Flow::Shutdown.is_terminal());
        assert_eq!(fx.stats.halt, 1);
        assert_eq!(fx.stats.shutdown, 1);
    }

    #[test]
    fn routine_exits_only_count() {
        let mut fx = Fixture::new();
        let mut buf = [0xaau8; 4];
        for outcome in [
            RunOutcome::Completed(GuestExit::Debug),
            RunOutcome::Completed(GuestExit::Interrupt),
            RunOutcome::Completed(GuestExit::MmioWrite { addr: 0xd000_0000, data: &[1, 2] }),
            RunOutcome::Interrupted,
        ] {
            assert_eq!(fx.dispatch(outcome).unwrap(), Flow::Continue);
        }
        fx.dispatch(RunOutcome::Completed(GuestExit::MmioRead { addr: 0xd000_0000, data: &mut buf }))
            .unwrap();
        assert_eq!(buf, [0; 4]);
        assert_eq!(fx.stats.total, 5);
        assert_eq!(fx.stats.interrupt, 2);
        assert_eq!(fx.stats.mmio, 2);
        assert_eq!(fx.stats.debug, 1);
    }

    #[test]
    fn unrecognized_exit_is_fatal() {
        let mut fx = Fixture::new();
        let err = fx
            .dispatch(RunOutcome::Completed(GuestExit::Unrecognized("FailEntry(0, 0)".into())))
            .unwrap_err();
        assert!(matches!(err, VMError::UnrecognizedExit { .. }));
    }

    #[test]
    fn failed_run_is_fatal_but_interruption_is_not() {
        let mut fx = Fixture::new();
        assert_eq!(fx.dispatch(RunOutcome::Interrupted).unwrap(), Flow::Continue);
        let err = fx
            .dispatch(RunOutcome::Failed(kvm_ioctls::Error::new(libc::EFAULT)))
            .unwrap_err();
        assert!(matches!(err, VMError::Execution { .. }));
    }
}
