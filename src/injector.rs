//! # Injector Module
//!
//! The whole injection, from resolving the function in the supervisor to letting the traced
//! process call it.
//!
//! 1. resolve the function locally and copy its code
//! 2. find the traced binary in the memory map of the process
//! 3. stop the process at a breakpoint inside that binary
//! 4. write the code to a landing address in the process
//! 5. point a function pointer slot of the binary at it
//! 6. optionally let the process run and see how it stops next

use serde::Serialize;
use tracing::{error, info, warn};

use crate::addr::Addr;
use crate::config::{InjectionConfig, LandingStrategy, SlotTarget};
use crate::errors::{InjectorError, Result};
use crate::extract::{CodeBlob, CodeExtractor};
use crate::memorymap::AddressSpaceMap;
use crate::placement::ReachableAddressFinder;
use crate::redirect::ControlFlowRedirector;
use crate::remote::WriteStats;
use crate::session::{DebugSession, SessionState, StopEvent};
use crate::symbols::SymbolResolver;
use crate::tracer::Tracer;
use crate::WORD_BYTES;

/// Where the memory map of the traced process comes from
pub trait MapSource {
    fn snapshot(&self, pid: i32) -> Result<AddressSpaceMap>;
}

/// Reads `/proc/<pid>/maps`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMaps;

impl MapSource for ProcMaps {
    fn snapshot(&self, pid: i32) -> Result<AddressSpaceMap> {
        AddressSpaceMap::from_pid(pid)
    }
}

impl MapSource for AddressSpaceMap {
    fn snapshot(&self, _pid: i32) -> Result<AddressSpaceMap> {
        Ok(self.clone())
    }
}

/// What an injection did
#[derive(Debug, Clone, Serialize)]
pub struct InjectionReport {
    pub pid: i32,
    pub symbol: String,
    pub source: Addr,
    pub code_len: usize,
    pub module_base: Addr,
    pub breakpoint: Addr,
    pub slot: Addr,
    pub previous_slot_value: Addr,
    pub landing: Addr,
    pub redirected_to: Addr,
    pub code_write: WriteStats,
    pub final_state: SessionState,
    pub final_event: Option<String>,
}

pub struct Injector<'c, M: MapSource> {
    config: &'c InjectionConfig,
    maps: M,
}

impl<'c> Injector<'c, ProcMaps> {
    #[must_use]
    pub fn new(config: &'c InjectionConfig) -> Self {
        Self {
            config,
            maps: ProcMaps,
        }
    }
}

impl<'c, M: MapSource> Injector<'c, M> {
    #[must_use]
    pub fn with_map_source<N: MapSource>(self, maps: N) -> Injector<'c, N> {
        Injector {
            config: self.config,
            maps,
        }
    }

    /// Attaches to the configured process and runs the injection
    ///
    /// # Errors
    ///
    /// See [`Self::run_in`].
    pub fn run<T: Tracer>(
        &self,
        tracer: T,
        resolver: &mut impl SymbolResolver,
    ) -> Result<InjectionReport> {
        let pid = nix::unistd::Pid::from_raw(self.config.pid()?);
        let mut session = DebugSession::attach(tracer, pid, self.config.allow_preattached)?;
        let report = self.run_in(&mut session, resolver);
        if let Err(e) = &report {
            error!("injection failed: {e}");
        }
        session.detach()?;
        report
    }

    /// Runs the injection in an existing session
    ///
    /// # Errors
    ///
    /// Every failure aborts the injection. The breakpoint is removed where the process still
    /// exists, but code that was already written stays in place.
    pub fn run_in<T: Tracer>(
        &self,
        session: &mut DebugSession<T>,
        resolver: &mut impl SymbolResolver,
    ) -> Result<InjectionReport> {
        let config = self.config;
        let pid = session.pid().as_raw();

        let blob = self.extract(resolver)?;

        let map = self.maps.snapshot(pid)?;
        if map.is_empty() {
            return Err(InjectorError::MapParse {
                pid,
                reason: "no mapped ranges".into(),
            });
        }
        let base = map.module_base(&config.module_name)?;
        let breakpoint = module_offset(base, config.breakpoint_offset, "breakpoint_offset")?;
        let slot = module_offset(base, config.slot_offset, "slot_offset")?;
        let module_target = match config.slot_target {
            SlotTarget::Landing => None,
            SlotTarget::ModuleOffset(off) => Some(module_offset(base, off, "slot_target")?),
        };
        info!("{} is mapped at {base}, breakpoint {breakpoint}, slot {slot}", config.module_name);

        Self::stop_at(session, breakpoint)?;

        let landing = match config.landing {
            LandingStrategy::FreeRegion => {
                ReachableAddressFinder::new(&map).require_near(slot, blob.len())?
            }
            LandingStrategy::BelowStackPointer => {
                let rsp = Addr::from(session.read_registers()?.rsp);
                (rsp - blob.len()).align_down(WORD_BYTES)
            }
        };
        info!("writing {} bytes to {landing}", blob.len());
        let code_write = session.memory().write_verified(landing, blob.bytes())?;

        let replacement = module_target.unwrap_or(landing);
        let redirection = ControlFlowRedirector::redirect(&mut *session, slot, replacement)?;

        let final_event = if config.resume_after {
            session.resume()?;
            let event = session.wait_for_stop()?;
            info!("after redirection: {event}");
            Some(event.to_string())
        } else {
            None
        };

        Ok(InjectionReport {
            pid,
            symbol: config.symbol.clone(),
            source: blob.source(),
            code_len: blob.len(),
            module_base: base,
            breakpoint,
            slot,
            previous_slot_value: redirection.previous,
            landing,
            redirected_to: replacement,
            code_write,
            final_state: session.state(),
            final_event,
        })
    }

    fn extract(&self, resolver: &mut impl SymbolResolver) -> Result<CodeBlob> {
        let addr = resolver.resolve(&self.config.library, &self.config.symbol)?;
        let extractor = CodeExtractor::new()?;
        Ok(extractor.extract(addr, self.config.code_len))
    }

    /// Runs the process until it executes `addr` and leaves it stopped there
    fn stop_at<T: Tracer>(session: &mut DebugSession<T>, addr: Addr) -> Result<()> {
        session.install_breakpoint(addr)?;
        loop {
            session.resume()?;
            match session.wait_for_stop()? {
                StopEvent::Breakpoint(_) => break,
                event if event.is_gone() => {
                    warn!("process ended before reaching {addr}: {event}");
                    return Err(InjectorError::TargetExited);
                }
                event => info!("waiting for breakpoint at {addr}, ignoring {event}"),
            }
        }
        session.rewind_breakpoint()?;
        Ok(())
    }
}

fn module_offset(base: Addr, offset: usize, field: &str) -> Result<Addr> {
    base.checked_add(offset).ok_or_else(|| {
        InjectorError::Config(format!("{field} {offset:#x} does not fit behind base {base}"))
    })
}

#[cfg(test)]
mod test {
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    use super::*;
    use crate::symbols::SymbolResolver;
    use crate::testing::{FakeTracer, Script};
    use crate::Word;

    static FOO: [u8; 23] = [
        0xf3, 0x0f, 0x1e, 0xfa, 0x55, 0x48, 0x89, 0xe5, 0xbf, 0x2a, 0x00, 0x00, 0x00, 0xb8, 0x00,
        0x00, 0x00, 0x00, 0x90, 0x5d, 0xc3, 0x90, 0x90,
    ];

    const BASE: usize = 0x5555_5555_4000;
    const MAIN: usize = BASE + 0x11c5;
    const G: usize = BASE + 0x11a9;
    const SLOT: usize = BASE + 0x3fc8;
    const PLT: usize = BASE + 0x1036;
    const STACK: usize = 0x7fff_ffff_e000;

    struct StaticResolver;

    impl SymbolResolver for StaticResolver {
        fn resolve(&mut self, _library: &str, symbol: &str) -> Result<Addr> {
            match symbol {
                "foo" => Ok(Addr::from(FOO.as_ptr() as usize)),
                _ => Err(InjectorError::SymbolNotFound {
                    library: String::new(),
                    symbol: symbol.to_string(),
                    reason: "not here".into(),
                }),
            }
        }
    }

    fn map() -> AddressSpaceMap {
        AddressSpaceMap::parse(&format!(
            "{:x}-{:x} r--p 00000000 08:01 1 /home/user/noF_debug\n\
             {:x}-{:x} r-xp 00001000 08:01 1 /home/user/noF_debug\n\
             {:x}-{:x} rw-p 00003000 08:01 1 /home/user/noF_debug\n\
             {:x}-{:x} rw-p 00000000 00:00 0 [stack]\n",
            BASE,
            BASE + 0x1000,
            BASE + 0x1000,
            BASE + 0x2000,
            BASE + 0x3000,
            BASE + 0x5000,
            STACK - 0x1000,
            STACK + 0x1000,
        ))
    }

    fn config() -> InjectionConfig {
        serde_json::from_str(
            r#"{
                "pid": 4242,
                "library": "lib4.so",
                "symbol": "foo",
                "code_len": 23,
                "module_name": "noF_debug",
                "breakpoint_offset": "0x11c5",
                "slot_offset": "0x3fc8"
            }"#,
        )
        .unwrap()
    }

    /// A process whose text, GOT and stack are backed by the fake, and whose landing gap is
    /// mapped behind the back of the memory map snapshot
    fn process(landing: Addr) -> FakeTracer {
        let mut t = FakeTracer::new();
        let mem = t.memory();
        mem.map(Addr::from(BASE + 0x1000), &[0x90; 0x1000]);
        mem.map(Addr::from(SLOT), &(PLT as Word).to_ne_bytes());
        mem.map(Addr::from(STACK - 0x1000), &[0u8; 0x2000]);
        mem.map(landing, &[0u8; 32]);
        t.regs_mut().rsp = STACK as u64;
        t
    }

    #[test]
    fn test_inject_into_free_region() {
        let landing = Addr::from(BASE + 0x2000);
        let mut t = process(landing);
        t.script(Script::Execute(Addr::from(BASE + 0x1100)));
        t.script(Script::Execute(Addr::from(MAIN)));
        t.script(Script::CallThrough(Addr::from(SLOT)));
        t.script(Script::Exit(0));

        let config = config();
        let injector = Injector::new(&config).with_map_source(map());
        let mut session = DebugSession::attach(t, Pid::from_raw(4242), false).unwrap();
        let report = injector.run_in(&mut session, &mut StaticResolver).unwrap();

        assert_eq!(report.module_base, Addr::from(BASE));
        assert_eq!(report.breakpoint, Addr::from(MAIN));
        assert_eq!(report.slot, Addr::from(SLOT));
        assert_eq!(report.landing, landing);
        assert_eq!(report.redirected_to, landing);
        assert_eq!(report.previous_slot_value, Addr::from(PLT));
        assert_eq!(
            report.code_write,
            WriteStats {
                full_words: 2,
                partial_words: 1
            }
        );
        assert_eq!(report.final_state, SessionState::Exited);
        assert_eq!(report.final_event.as_deref(), Some("exited with code 0"));

        let t = session.tracer();
        assert_eq!(t.calls(), &[landing]);
    }

    #[test]
    fn test_injected_bytes_and_restored_breakpoint() {
        let landing = Addr::from(BASE + 0x2000);
        let mut t = process(landing);
        t.script(Script::Execute(Addr::from(MAIN)));

        let mut config = config();
        config.resume_after = false;
        let injector = Injector::new(&config).with_map_source(map());
        let mut session = DebugSession::attach(t, Pid::from_raw(4242), false).unwrap();
        let report = injector.run_in(&mut session, &mut StaticResolver).unwrap();

        assert_eq!(report.final_state, SessionState::Stopped);
        assert_eq!(report.final_event, None);
        assert_eq!(session.read_registers().unwrap().rip, MAIN as u64);
        assert_eq!(session.memory().read_bytes(landing, 23).unwrap(), FOO.to_vec());
        // the breakpoint byte is back
        assert_eq!(session.memory().read_bytes(Addr::from(MAIN), 1).unwrap(), vec![0x90]);
        assert!(session.breakpoint().is_none());
    }

    #[test]
    fn test_inject_below_stack_pointer_with_module_target() {
        let mut t = process(Addr::from(BASE + 0x2000));
        t.script(Script::Execute(Addr::from(MAIN)));
        t.script(Script::CallThrough(Addr::from(SLOT)));

        let mut config = config();
        config.landing = LandingStrategy::BelowStackPointer;
        config.slot_target = SlotTarget::ModuleOffset(0x11a9);
        let injector = Injector::new(&config).with_map_source(map());
        let mut session = DebugSession::attach(t, Pid::from_raw(4242), false).unwrap();
        let report = injector.run_in(&mut session, &mut StaticResolver).unwrap();

        // 23 bytes below the stack pointer, rounded down to a word
        assert_eq!(report.landing, Addr::from(STACK - 24));
        assert_eq!(report.redirected_to, Addr::from(G));
        assert_eq!(session.tracer().calls(), &[Addr::from(G)]);
    }

    #[test]
    fn test_signals_before_breakpoint_are_waited_through() {
        let landing = Addr::from(BASE + 0x2000);
        let mut t = process(landing);
        t.script(Script::Signal(Signal::SIGCHLD));
        t.script(Script::Execute(Addr::from(MAIN)));

        let mut config = config();
        config.resume_after = false;
        let injector = Injector::new(&config).with_map_source(map());
        let mut session = DebugSession::attach(t, Pid::from_raw(4242), false).unwrap();
        let report = injector.run_in(&mut session, &mut StaticResolver).unwrap();
        assert_eq!(report.landing, landing);
    }

    #[test]
    fn test_exit_before_breakpoint() {
        let mut t = process(Addr::from(BASE + 0x2000));
        t.script(Script::Exit(1));

        let config = config();
        let injector = Injector::new(&config).with_map_source(map());
        let mut session = DebugSession::attach(t, Pid::from_raw(4242), false).unwrap();
        assert!(matches!(
            injector.run_in(&mut session, &mut StaticResolver),
            Err(InjectorError::TargetExited)
        ));
        assert_eq!(session.state(), SessionState::Exited);
    }

    #[test]
    fn test_no_placement_aborts_before_writing() {
        let landing = Addr::from(BASE + 0x2000);
        let mut t = process(landing);
        t.script(Script::Execute(Addr::from(MAIN)));

        // a 4 GiB mapping right below the binary pushes the only gap out of reach
        let map = AddressSpaceMap::parse(&format!(
            "1000-2000 r--p 0 0:0 0 /x\n\
             {:x}-{:x} rw-p 00000000 00:00 0\n\
             {:x}-{:x} r-xp 00001000 08:01 1 /home/user/noF_debug\n",
            BASE - 0x1_0000_0000,
            BASE,
            BASE,
            BASE + 0x5000,
        ));
        let config = config();
        let injector = Injector::new(&config).with_map_source(map);
        let mut session = DebugSession::attach(t, Pid::from_raw(4242), false).unwrap();
        assert!(matches!(
            injector.run_in(&mut session, &mut StaticResolver),
            Err(InjectorError::NoPlacementFound { .. })
        ));
        assert_eq!(
            session.memory().read_bytes(Addr::from(SLOT), 8).unwrap(),
            (PLT as Word).to_ne_bytes().to_vec()
        );
    }

    #[test]
    fn test_missing_module() {
        let t = process(Addr::from(BASE + 0x2000));
        let mut config = config();
        config.module_name = "not_the_binary".into();
        let injector = Injector::new(&config).with_map_source(map());
        let mut session = DebugSession::attach(t, Pid::from_raw(4242), false).unwrap();
        assert!(matches!(
            injector.run_in(&mut session, &mut StaticResolver),
            Err(InjectorError::ModuleNotMapped(_))
        ));
    }

    #[test]
    fn test_offset_overflow_is_config_error() {
        let t = process(Addr::from(BASE + 0x2000));
        let mut config = config();
        config.breakpoint_offset = usize::MAX;
        let injector = Injector::new(&config).with_map_source(map());
        let mut session = DebugSession::attach(t, Pid::from_raw(4242), false).unwrap();
        assert!(matches!(
            injector.run_in(&mut session, &mut StaticResolver),
            Err(InjectorError::Config(_))
        ));
        assert!(session.breakpoint().is_none());

        config.breakpoint_offset = 0x11c5;
        config.slot_target = SlotTarget::ModuleOffset(usize::MAX - 0x1000);
        let injector = Injector::new(&config).with_map_source(map());
        let t = process(Addr::from(BASE + 0x2000));
        let mut session = DebugSession::attach(t, Pid::from_raw(4242), false).unwrap();
        assert!(matches!(
            injector.run_in(&mut session, &mut StaticResolver),
            Err(InjectorError::Config(_))
        ));
        assert!(session.breakpoint().is_none());
        assert_eq!(
            session.memory().read_bytes(Addr::from(SLOT), 8).unwrap(),
            (PLT as Word).to_ne_bytes().to_vec()
        );
    }

    #[test]
    fn test_empty_map_aborts() {
        let t = process(Addr::from(BASE + 0x2000));
        let config = config();
        let injector = Injector::new(&config).with_map_source(AddressSpaceMap::default());
        let mut session = DebugSession::attach(t, Pid::from_raw(4242), false).unwrap();
        assert!(matches!(
            injector.run_in(&mut session, &mut StaticResolver),
            Err(InjectorError::MapParse { .. })
        ));
    }

    #[test]
    fn test_run_detaches() {
        let landing = Addr::from(BASE + 0x2000);
        let mut t = process(landing);
        t.script(Script::Execute(Addr::from(MAIN)));
        t.script(Script::Signal(Signal::SIGUSR1));
        let detached = t.detached_flag();

        let config = config();
        let injector = Injector::new(&config).with_map_source(map());
        let report = injector.run(t, &mut StaticResolver).unwrap();
        assert_eq!(report.final_event.as_deref(), Some("stopped by SIGUSR1"));
        assert!(detached.get());
    }
}
