//! # Tracer Module
//!
//! The process control surface that everything else is built on.
//!
//! [`Tracer`] lists the primitive operations a supervisor needs to control a traced process:
//! attach, register and word access, resume, wait and detach. [`Ptrace`] implements them with
//! [ptrace](nix::sys::ptrace) and [waitpid]. The primitives only report raw OS errors; the
//! bookkeeping about what state the traced process is in lives in
//! [`DebugSession`](crate::session::DebugSession).

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::sys::ptrace;
use nix::unistd::Pid;
use tracing::trace;

use crate::addr::Addr;
use crate::Word;

/// General purpose registers of the traced process
pub type Registers = nix::libc::user_regs_struct;

/// How the traced process reported back after a wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStatus {
    /// Stopped by a signal and can be inspected
    Stopped(Signal),
    /// Exited normally with the given code
    Exited(i32),
    /// Terminated by a signal
    Signaled(Signal),
}

impl StopStatus {
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Signaled(_))
    }
}

/// Primitive operations on a traced process
///
/// All operations are synchronous. [`Tracer::wait`] is the only one that blocks for longer than
/// a system call takes; it returns when the process stops or ends.
pub trait Tracer {
    fn attach(&mut self, pid: Pid) -> nix::Result<()>;
    fn get_regs(&mut self, pid: Pid) -> nix::Result<Registers>;
    fn set_regs(&mut self, pid: Pid, regs: Registers) -> nix::Result<()>;
    fn read_word(&mut self, pid: Pid, addr: Addr) -> nix::Result<Word>;
    fn write_word(&mut self, pid: Pid, addr: Addr, value: Word) -> nix::Result<()>;
    fn cont(&mut self, pid: Pid, sig: Option<Signal>) -> nix::Result<()>;
    fn wait(&mut self, pid: Pid) -> nix::Result<StopStatus>;
    /// Ask a running process to stop, the stop has to be collected with [`Tracer::wait`]
    fn interrupt(&mut self, pid: Pid) -> nix::Result<()>;
    fn detach(&mut self, pid: Pid) -> nix::Result<()>;
}

/// [`Tracer`] for Linux processes
#[derive(Debug, Clone, Copy, Default)]
pub struct Ptrace;

impl Tracer for Ptrace {
    fn attach(&mut self, pid: Pid) -> nix::Result<()> {
        ptrace::attach(pid)
    }

    fn get_regs(&mut self, pid: Pid) -> nix::Result<Registers> {
        ptrace::getregs(pid)
    }

    fn set_regs(&mut self, pid: Pid, regs: Registers) -> nix::Result<()> {
        ptrace::setregs(pid, regs)
    }

    fn read_word(&mut self, pid: Pid, addr: Addr) -> nix::Result<Word> {
        ptrace::read(pid, addr.into())
    }

    fn write_word(&mut self, pid: Pid, addr: Addr, value: Word) -> nix::Result<()> {
        ptrace::write(pid, addr.into(), value)
    }

    fn cont(&mut self, pid: Pid, sig: Option<Signal>) -> nix::Result<()> {
        ptrace::cont(pid, sig)
    }

    fn wait(&mut self, pid: Pid) -> nix::Result<StopStatus> {
        loop {
            let status = waitpid(pid, None)?;
            trace!("wait status: {status:?}");
            return Ok(match status {
                WaitStatus::Stopped(_, sig) => StopStatus::Stopped(sig),
                WaitStatus::PtraceEvent(_, sig, _) => StopStatus::Stopped(sig),
                WaitStatus::PtraceSyscall(_) => StopStatus::Stopped(Signal::SIGTRAP),
                WaitStatus::Exited(_, code) => StopStatus::Exited(code),
                WaitStatus::Signaled(_, sig, _) => StopStatus::Signaled(sig),
                WaitStatus::Continued(_) | WaitStatus::StillAlive => continue,
            });
        }
    }

    fn interrupt(&mut self, pid: Pid) -> nix::Result<()> {
        signal::kill(pid, Signal::SIGSTOP)
    }

    fn detach(&mut self, pid: Pid) -> nix::Result<()> {
        ptrace::detach(pid, None)
    }
}
