//! In-memory stand-ins for a traced process, for tests only

use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::addr::Addr;
use crate::breakpoint::INT3_BYTE;
use crate::errors::Result;
use crate::remote::WordMemory;
use crate::tracer::{Registers, StopStatus, Tracer};
use crate::{Word, WORD_BYTES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Read(Addr),
    Write(Addr, Word),
}

/// Byte addressed sparse memory, unmapped bytes fault with `EIO`
#[derive(Debug, Default)]
pub struct FakeMemory {
    bytes: BTreeMap<usize, u8>,
    ops: Vec<MemOp>,
    corrupt_at: Option<Addr>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(&mut self, addr: Addr, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(addr.usize() + i, *b);
        }
    }

    pub fn bytes(&self, addr: Addr, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.bytes[&(addr.usize() + i)])
            .collect()
    }

    pub fn byte(&self, addr: Addr) -> Option<u8> {
        self.bytes.get(&addr.usize()).copied()
    }

    pub fn take_ops(&mut self) -> Vec<MemOp> {
        std::mem::take(&mut self.ops)
    }

    /// Every word written to `addr` lands with its bits flipped
    pub fn corrupt_writes_at(&mut self, addr: Addr) {
        self.corrupt_at = Some(addr);
    }

    fn peek(&mut self, addr: Addr) -> nix::Result<Word> {
        let mut buf = [0u8; WORD_BYTES];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = *self.bytes.get(&(addr.usize() + i)).ok_or(Errno::EIO)?;
        }
        self.ops.push(MemOp::Read(addr));
        Ok(Word::from_ne_bytes(buf))
    }

    fn poke(&mut self, addr: Addr, mut value: Word) -> nix::Result<()> {
        if (0..WORD_BYTES).any(|i| !self.bytes.contains_key(&(addr.usize() + i))) {
            return Err(Errno::EIO);
        }
        self.ops.push(MemOp::Write(addr, value));
        if self.corrupt_at == Some(addr) {
            value = !value;
        }
        self.map(addr, &value.to_ne_bytes());
        Ok(())
    }
}

impl WordMemory for FakeMemory {
    fn read_word(&mut self, addr: Addr) -> Result<Word> {
        Ok(self.peek(addr)?)
    }

    fn write_word(&mut self, addr: Addr, value: Word) -> Result<()> {
        Ok(self.poke(addr, value)?)
    }
}

/// What the fake process does when it runs
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Executes the instruction at this address, trapping if it is an `int3`
    Execute(Addr),
    /// Calls through the function pointer stored at this address
    CallThrough(Addr),
    Signal(Signal),
    Exit(i32),
}

pub struct FakeTracer {
    memory: FakeMemory,
    regs: Registers,
    script: VecDeque<Script>,
    pending: VecDeque<StopStatus>,
    attach_error: Option<Errno>,
    gone: bool,
    detached: Rc<Cell<bool>>,
    calls: Vec<Addr>,
}

impl FakeTracer {
    pub fn new() -> Self {
        Self {
            memory: FakeMemory::new(),
            // SAFETY: plain old data, all zeroes is a valid register set
            regs: unsafe { std::mem::zeroed() },
            script: VecDeque::new(),
            pending: VecDeque::new(),
            attach_error: None,
            gone: false,
            detached: Rc::new(Cell::new(false)),
            calls: Vec::new(),
        }
    }

    pub fn memory(&mut self) -> &mut FakeMemory {
        &mut self.memory
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    /// A stop that is reported before anything the script does, and before a later interrupt
    pub fn queue_stop(&mut self, sig: Signal) {
        self.pending.push_back(StopStatus::Stopped(sig));
    }

    pub fn pending_stops(&self) -> usize {
        self.pending.len()
    }

    pub fn script(&mut self, step: Script) {
        self.script.push_back(step);
    }

    pub fn reject_attach(&mut self, errno: Errno) {
        self.attach_error = Some(errno);
    }

    /// The process disappears, every request fails with `ESRCH` from now on
    pub fn vanish(&mut self) {
        self.gone = true;
    }

    pub fn is_detached(&self) -> bool {
        self.detached.get()
    }

    pub fn detached_flag(&self) -> Rc<Cell<bool>> {
        self.detached.clone()
    }

    /// Targets of all [`Script::CallThrough`] steps executed so far
    pub fn calls(&self) -> &[Addr] {
        &self.calls
    }

    fn alive(&self) -> nix::Result<()> {
        if self.gone {
            Err(Errno::ESRCH)
        } else {
            Ok(())
        }
    }

    fn run(&mut self) -> StopStatus {
        while let Some(step) = self.script.pop_front() {
            match step {
                Script::Execute(addr) => {
                    self.regs.rip = addr.u64();
                    if self.memory.byte(addr) == Some(INT3_BYTE) {
                        self.regs.rip += 1;
                        return StopStatus::Stopped(Signal::SIGTRAP);
                    }
                }
                Script::CallThrough(slot) => {
                    let target = self.memory.peek(slot).expect("call through unmapped slot");
                    self.calls.push(Addr::from(target));
                }
                Script::Signal(sig) => return StopStatus::Stopped(sig),
                Script::Exit(code) => {
                    self.gone = true;
                    return StopStatus::Exited(code);
                }
            }
        }
        self.gone = true;
        StopStatus::Exited(0)
    }
}

impl Tracer for FakeTracer {
    fn attach(&mut self, _pid: Pid) -> nix::Result<()> {
        self.alive()?;
        if let Some(errno) = self.attach_error {
            return Err(errno);
        }
        self.pending.push_back(StopStatus::Stopped(Signal::SIGSTOP));
        Ok(())
    }

    fn get_regs(&mut self, _pid: Pid) -> nix::Result<Registers> {
        self.alive()?;
        Ok(self.regs)
    }

    fn set_regs(&mut self, _pid: Pid, regs: Registers) -> nix::Result<()> {
        self.alive()?;
        self.regs = regs;
        Ok(())
    }

    fn read_word(&mut self, _pid: Pid, addr: Addr) -> nix::Result<Word> {
        self.alive()?;
        self.memory.peek(addr)
    }

    fn write_word(&mut self, _pid: Pid, addr: Addr, value: Word) -> nix::Result<()> {
        self.alive()?;
        self.memory.poke(addr, value)
    }

    fn cont(&mut self, _pid: Pid, _sig: Option<Signal>) -> nix::Result<()> {
        self.alive()
    }

    fn wait(&mut self, _pid: Pid) -> nix::Result<StopStatus> {
        if let Some(status) = self.pending.pop_front() {
            return Ok(status);
        }
        if self.gone {
            return Err(Errno::ECHILD);
        }
        Ok(self.run())
    }

    fn interrupt(&mut self, _pid: Pid) -> nix::Result<()> {
        self.alive()?;
        self.pending.push_back(StopStatus::Stopped(Signal::SIGSTOP));
        Ok(())
    }

    fn detach(&mut self, _pid: Pid) -> nix::Result<()> {
        self.alive()?;
        self.detached.set(true);
        Ok(())
    }
}
