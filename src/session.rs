//! # Session Module
//!
//! The lifecycle of one traced process.
//!
//! A [`DebugSession`] owns the [`Tracer`], the [`RemoteHandle`] of the traced process and the
//! [`BreakpointManager`]. All register and memory access goes through it, and it refuses access
//! whenever the traced process is not stopped:
//!
//! ```text
//! Detached -> Attached -> Stopped <-> Running
//!                 |          |           |
//!                 +----------+-----------+--> Exited
//! ```
//!
//! [`DebugSession::wait_for_stop`] is the only place where the supervisor waits for the traced
//! process. If the process never stops again, it waits forever.

use std::fmt::Display;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::addr::Addr;
use crate::breakpoint::{Breakpoint, BreakpointManager};
use crate::errors::{InjectorError, Result};
use crate::remote::{RemoteMemory, WordMemory};
use crate::tracer::{Registers, StopStatus, Tracer};
use crate::Word;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Detached,
    /// Traced, but the stop that made it traced has not been observed by this session
    Attached,
    Stopped,
    Running,
    Exited,
}

impl Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Detached => "detached",
            Self::Attached => "attached",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Exited => "exited",
        };
        write!(f, "{s}")
    }
}

/// The traced process and what the session knows about its state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemoteHandle {
    #[serde(serialize_with = "serialize_pid")]
    pid: Pid,
    state: SessionState,
}

fn serialize_pid<S: serde::Serializer>(pid: &Pid, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_i32(pid.as_raw())
}

impl RemoteHandle {
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }
}

/// Why [`DebugSession::wait_for_stop`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// The installed breakpoint was executed
    Breakpoint(Addr),
    /// Stopped by some other signal
    Signal(Signal),
    Exited(i32),
    Killed(Signal),
}

impl StopEvent {
    #[must_use]
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed(_))
    }
}

impl Display for StopEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Breakpoint(addr) => write!(f, "breakpoint at {addr}"),
            Self::Signal(sig) => write!(f, "stopped by {sig}"),
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Killed(sig) => write!(f, "killed by {sig}"),
        }
    }
}

pub struct DebugSession<T: Tracer> {
    tracer: T,
    handle: RemoteHandle,
    breakpoints: BreakpointManager,
    /// The last stop was the breakpoint and the program counter still points behind it
    hit_pending: bool,
}

impl<T: Tracer> DebugSession<T> {
    fn new(tracer: T, pid: Pid) -> Self {
        Self {
            tracer,
            handle: RemoteHandle {
                pid,
                state: SessionState::Detached,
            },
            breakpoints: BreakpointManager::new(),
            hit_pending: false,
        }
    }

    /// Attaches to a running process and waits until it stopped
    ///
    /// If the attach request is rejected and `allow_preattached` is set, the process is assumed
    /// to be traced by us already (a child that requested tracing itself before running its
    /// program) and stopped. The session then continues in [`SessionState::Attached`].
    ///
    /// # Errors
    ///
    /// Returns [`InjectorError::Attach`] if the attach request fails and `allow_preattached` is
    /// not set, or [`InjectorError::TargetExited`] if the process ends before it stops.
    pub fn attach(tracer: T, pid: Pid, allow_preattached: bool) -> Result<Self> {
        let mut session = Self::new(tracer, pid);
        match session.tracer.attach(pid) {
            Ok(()) => {
                session.handle.state = SessionState::Attached;
                info!("attached to process {pid}");
                if session.wait_for_stop()?.is_gone() {
                    return Err(InjectorError::TargetExited);
                }
            }
            Err(e) if allow_preattached => {
                warn!("could not attach to {pid} ({e}), assuming it is traced and stopped already");
                session.handle.state = SessionState::Attached;
            }
            Err(source) => return Err(InjectorError::Attach { pid: pid.as_raw(), source }),
        }
        Ok(session)
    }

    /// Takes over a child that requested tracing itself and waits for its first stop
    ///
    /// # Errors
    ///
    /// Returns [`InjectorError::TargetExited`] if the child ends before it stops.
    pub fn adopt(tracer: T, pid: Pid) -> Result<Self> {
        let mut session = Self::new(tracer, pid);
        session.handle.state = SessionState::Attached;
        if session.wait_for_stop()?.is_gone() {
            return Err(InjectorError::TargetExited);
        }
        Ok(session)
    }

    #[inline]
    #[must_use]
    pub fn handle(&self) -> RemoteHandle {
        self.handle
    }

    #[inline]
    #[must_use]
    pub fn pid(&self) -> Pid {
        self.handle.pid
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.handle.state
    }

    #[must_use]
    pub fn tracer(&self) -> &T {
        &self.tracer
    }

    #[must_use]
    pub fn breakpoint(&self) -> Option<Breakpoint> {
        self.breakpoints.current()
    }

    fn expect_state(&self, expected: &'static str, ok: &[SessionState]) -> Result<()> {
        if ok.contains(&self.handle.state) {
            Ok(())
        } else {
            Err(InjectorError::InvalidState {
                expected,
                actual: self.handle.state,
            })
        }
    }

    /// Turns `ESRCH` into [`InjectorError::TargetExited`]
    ///
    /// `ESRCH` from a ptrace request on a process we trace means it is gone.
    fn check<R>(&mut self, res: nix::Result<R>) -> Result<R> {
        match res {
            Ok(r) => Ok(r),
            Err(Errno::ESRCH) => {
                warn!("process {} is gone", self.handle.pid);
                self.mark_exited();
                Err(InjectorError::TargetExited)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn mark_exited(&mut self) {
        self.handle.state = SessionState::Exited;
        self.hit_pending = false;
        if let Some(bp) = self.breakpoints.forget() {
            debug!("dropping breakpoint at {} of exited process", bp.addr());
        }
    }

    /// # Errors
    ///
    /// Returns [`InjectorError::InvalidState`] unless the process is stopped.
    pub fn read_registers(&mut self) -> Result<Registers> {
        self.expect_state("stopped", &[SessionState::Stopped])?;
        let res = self.tracer.get_regs(self.handle.pid);
        self.check(res)
    }

    /// # Errors
    ///
    /// Returns [`InjectorError::InvalidState`] unless the process is stopped.
    pub fn write_registers(&mut self, regs: Registers) -> Result<()> {
        self.expect_state("stopped", &[SessionState::Stopped])?;
        let res = self.tracer.set_regs(self.handle.pid, regs);
        self.check(res)
    }

    /// Byte range access to the memory of the traced process
    pub fn memory(&mut self) -> RemoteMemory<'_, Self> {
        RemoteMemory::new(self)
    }

    /// Lets the process run until the next [`Self::wait_for_stop`]
    ///
    /// # Errors
    ///
    /// Returns [`InjectorError::InvalidState`] if the process is not stopped.
    pub fn resume(&mut self) -> Result<()> {
        self.resume_with(None)
    }

    fn resume_with(&mut self, sig: Option<Signal>) -> Result<()> {
        self.expect_state("stopped", &[SessionState::Stopped, SessionState::Attached])?;
        let res = self.tracer.cont(self.handle.pid, sig);
        self.check(res)?;
        self.handle.state = SessionState::Running;
        self.hit_pending = false;
        debug!("resumed process {}", self.handle.pid);
        Ok(())
    }

    /// Blocks until the process stops or ends
    ///
    /// A `SIGTRAP` stop right behind the installed breakpoint is reported as
    /// [`StopEvent::Breakpoint`] with the address of the breakpoint, not the program counter.
    ///
    /// # Errors
    ///
    /// Returns [`InjectorError::InvalidState`] if the process is neither running nor freshly
    /// attached.
    pub fn wait_for_stop(&mut self) -> Result<StopEvent> {
        self.expect_state("running", &[SessionState::Running, SessionState::Attached])?;
        let res = self.tracer.wait(self.handle.pid);
        let status = self.check(res)?;
        if status.is_gone() {
            self.mark_exited();
        }

        let event = match status {
            StopStatus::Exited(code) => StopEvent::Exited(code),
            StopStatus::Signaled(sig) => StopEvent::Killed(sig),
            StopStatus::Stopped(sig) => {
                self.handle.state = SessionState::Stopped;
                match (sig, self.breakpoints.current()) {
                    (Signal::SIGTRAP, Some(bp)) => {
                        let pc = Addr::from(self.read_registers()?.rip);
                        if self.breakpoints.was_hit(pc) {
                            self.hit_pending = true;
                            StopEvent::Breakpoint(bp.addr())
                        } else {
                            trace!("SIGTRAP at {pc} is not the breakpoint at {}", bp.addr());
                            StopEvent::Signal(sig)
                        }
                    }
                    _ => StopEvent::Signal(sig),
                }
            }
        };
        debug!("process {}: {event}", self.handle.pid);
        Ok(event)
    }

    /// # Errors
    ///
    /// See [`BreakpointManager::install`]. The process must be stopped.
    pub fn install_breakpoint(&mut self, addr: Addr) -> Result<()> {
        self.expect_state("stopped", &[SessionState::Stopped, SessionState::Attached])?;
        let mut bps = std::mem::take(&mut self.breakpoints);
        let res = bps.install(&mut *self, addr);
        self.breakpoints = bps;
        res
    }

    /// # Errors
    ///
    /// See [`BreakpointManager::remove`]. The process must be stopped.
    pub fn remove_breakpoint(&mut self) -> Result<Option<Breakpoint>> {
        if !self.breakpoints.is_installed() {
            return Ok(None);
        }
        self.expect_state("stopped", &[SessionState::Stopped, SessionState::Attached])?;
        let mut bps = std::mem::take(&mut self.breakpoints);
        let res = bps.remove(&mut *self);
        self.breakpoints = bps;
        res
    }

    /// Removes the breakpoint that was just hit and moves the program counter back onto it
    ///
    /// After this, resuming executes the original instruction at the breakpoint address.
    ///
    /// # Errors
    ///
    /// Returns [`InjectorError::InvalidState`] if no breakpoint is installed or the process is
    /// not stopped.
    pub fn rewind_breakpoint(&mut self) -> Result<Addr> {
        let bp = self.remove_breakpoint()?.ok_or(InjectorError::InvalidState {
            expected: "stopped at a breakpoint",
            actual: self.handle.state,
        })?;
        let mut regs = self.read_registers()?;
        trace!("rewinding rip from {:#x} to {}", regs.rip, bp.addr());
        regs.rip = bp.addr().u64();
        self.write_registers(regs)?;
        self.hit_pending = false;
        Ok(bp.addr())
    }

    /// Restores the breakpoint and releases the process
    ///
    /// A running process is stopped first so the breakpoint can be restored. If the process
    /// stopped at the breakpoint, the program counter is moved back onto it before release.
    /// A signal the process received before the stop is passed on to it.
    ///
    /// # Errors
    ///
    /// Fails if the breakpoint can not be restored or the detach request fails. If the process
    /// is gone in the meantime, detaching succeeds.
    pub fn detach(&mut self) -> Result<()> {
        match self.handle.state {
            SessionState::Detached => return Ok(()),
            SessionState::Exited => {
                self.handle.state = SessionState::Detached;
                return Ok(());
            }
            SessionState::Running => {
                let res = self.tracer.interrupt(self.handle.pid);
                self.check_gone(res)?;
                if !self.collect_interrupt()? {
                    self.handle.state = SessionState::Detached;
                    return Ok(());
                }
            }
            SessionState::Attached | SessionState::Stopped => (),
        }

        let restored = if self.hit_pending {
            self.rewind_breakpoint().map(|_| ())
        } else {
            self.remove_breakpoint().map(|_| ())
        };
        if let Err(e) = restored {
            if self.state() != SessionState::Exited {
                return Err(e);
            }
        }
        if self.state() != SessionState::Exited {
            let res = self.tracer.detach(self.handle.pid);
            self.check_gone(res)?;
        }
        self.handle.state = SessionState::Detached;
        info!("detached from process {}", self.handle.pid);
        Ok(())
    }

    /// Waits for the stop caused by [`Tracer::interrupt`]
    ///
    /// Stops that were queued before it are handled on the way: a breakpoint hit is rewound,
    /// any other signal is handed back to the process. Returns `false` if the process ended
    /// instead.
    fn collect_interrupt(&mut self) -> Result<bool> {
        loop {
            if self.state() == SessionState::Exited {
                return Ok(false);
            }
            match self.wait_for_stop()? {
                StopEvent::Signal(Signal::SIGSTOP) => return Ok(true),
                StopEvent::Exited(_) | StopEvent::Killed(_) => return Ok(false),
                StopEvent::Breakpoint(addr) => {
                    debug!("breakpoint at {addr} hit while stopping to detach");
                    self.rewind_breakpoint()?;
                    self.resume_with(None)?;
                }
                StopEvent::Signal(sig) => {
                    debug!("passing {sig} on while stopping to detach");
                    self.resume_with(Some(sig))?;
                }
            }
        }
    }

    /// Like [`Self::check`], but a vanished process is not an error
    fn check_gone(&mut self, res: nix::Result<()>) -> Result<()> {
        match self.check(res) {
            Err(InjectorError::TargetExited) => Ok(()),
            other => other,
        }
    }
}

impl<T: Tracer> WordMemory for DebugSession<T> {
    fn read_word(&mut self, addr: Addr) -> Result<Word> {
        self.expect_state("stopped", &[SessionState::Stopped, SessionState::Attached])?;
        let res = self.tracer.read_word(self.handle.pid, addr);
        let word = self.check(res)?;
        trace!("read  {addr}: {word:016x}");
        Ok(word)
    }

    fn write_word(&mut self, addr: Addr, value: Word) -> Result<()> {
        self.expect_state("stopped", &[SessionState::Stopped, SessionState::Attached])?;
        trace!("write {addr}: {value:016x}");
        let res = self.tracer.write_word(self.handle.pid, addr, value);
        self.check(res)
    }
}

impl<T: Tracer> Drop for DebugSession<T> {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!("could not detach from process {}: {e}", self.handle.pid);
        }
    }
}
