use crate::common::{addr, Call};
use crate::debugger_env;
use trapctl::debugger::breakpoint::Trap;
use trapctl::debugger::engine::{DebugEvent, Resume};
use trapctl::debugger::register::debug::DebugRegisterNumber;
use trapctl::debugger::{
    BreakCondition, BreakSize, BreakpointChange, BreakpointKind, Error, ErrorKind, MemoryAccess,
    Selector, SoftwareTrap, StopReason, Toggle, TrapSpec,
};

fn hw_spec() -> TrapSpec {
    TrapSpec::Hardware {
        condition: BreakCondition::Execution,
        size: BreakSize::Bytes1,
    }
}

#[test]
fn test_software_breakpoint_by_ident() {
    debugger_env!(fake, info, debugger, {
        let view = debugger
            .set_software_breakpoint(addr(0x401000), None, false)
            .unwrap();
        assert_eq!(view.kind, BreakpointKind::Software);
        assert!(view.enabled);

        let found = debugger
            .breakpoint(BreakpointKind::Software, Selector::from_ident("0x401000"))
            .unwrap()
            .unwrap();
        assert_eq!(found.number, view.number);

        let toggle = debugger
            .disable_breakpoint(BreakpointKind::Software, Selector::from_ident("0x401000"))
            .unwrap();
        assert_eq!(toggle, Toggle::Changed);
        assert_eq!(
            fake.calls(),
            vec![
                Call::InstallSoftware(addr(0x401000), SoftwareTrap::Int3Short),
                Call::RemoveSoftware(addr(0x401000), vec![0x55]),
            ]
        );

        let toggle = debugger
            .disable_breakpoint(BreakpointKind::Software, addr(0x401000).into())
            .unwrap();
        assert_eq!(toggle, Toggle::AlreadyDisabled);

        let changes = info.changes.lock().unwrap().clone();
        assert_eq!(
            changes,
            vec![
                (BreakpointChange::Created, 0x401000),
                (BreakpointChange::Enabled, 0x401000),
                (BreakpointChange::Disabled, 0x401000),
            ]
        );
    });
}

#[test]
fn test_default_software_trap() {
    debugger_env!(fake, info, debugger, {
        debugger.set_default_software_trap(SoftwareTrap::Ud2);
        debugger
            .set_software_breakpoint(addr(0x401000), Some("entry"), false)
            .unwrap();
        assert_eq!(
            fake.calls(),
            vec![Call::InstallSoftware(addr(0x401000), SoftwareTrap::Ud2)]
        );

        let found = debugger
            .breakpoint(BreakpointKind::Software, Selector::from_ident("entry"))
            .unwrap()
            .unwrap();
        assert_eq!(found.addr, addr(0x401000));
        assert!(info.changes.lock().unwrap().len() >= 2);
    });
}

#[test]
fn test_breakpoint_hit_and_step_over_trap() {
    debugger_env!(fake, info, debugger, {
        debugger
            .set_software_breakpoint(addr(0x401000), Some("main"), false)
            .unwrap();

        fake.push(DebugEvent::Breakpoint(addr(0x401000)));
        debugger.run().unwrap();
        match debugger.wait_for_stop().unwrap() {
            StopReason::Breakpoint(view) => {
                assert_eq!(view.addr, addr(0x401000));
                assert_eq!(view.name.as_deref(), Some("main"));
            }
            other => panic!("unexpected stop: {other:?}"),
        }
        assert!(info
            .changes
            .lock()
            .unwrap()
            .contains(&(BreakpointChange::Hit, 0x401000)));

        // continue from a trap address, trap must be stepped over and reinstalled
        debugger.run().unwrap();
        assert_eq!(
            fake.calls(),
            vec![
                Call::InstallSoftware(addr(0x401000), SoftwareTrap::Int3Short),
                Call::RemoveSoftware(addr(0x401000), vec![0x55]),
                Call::InstallSoftware(addr(0x401000), SoftwareTrap::Int3Short),
            ]
        );
        assert_eq!(
            fake.resumes(),
            vec![Resume::run(), Resume::step(), Resume::run()]
        );

        fake.push(DebugEvent::Exited(0));
        assert!(matches!(
            debugger.wait_for_stop(),
            Err(Error::ProcessExit(0))
        ));
    });
}

#[test]
fn test_singleshot_breakpoint_deleted_on_hit() {
    debugger_env!(fake, info, debugger, {
        debugger
            .set_software_breakpoint(addr(0x401010), None, true)
            .unwrap();

        fake.push(DebugEvent::Breakpoint(addr(0x401010)));
        debugger.run().unwrap();
        let StopReason::Breakpoint(view) = debugger.wait_for_stop().unwrap() else {
            panic!("breakpoint stop expected");
        };
        assert!(view.singleshot);

        assert!(debugger
            .breakpoints(BreakpointKind::Software)
            .unwrap()
            .is_empty());
        assert_eq!(
            fake.calls().last(),
            Some(&Call::RemoveSoftware(addr(0x401010), vec![0x55]))
        );
        assert!(info.stops.lock().unwrap().len() >= 2);
    });
}

#[test]
fn test_hardware_register_exhaustion() {
    debugger_env!(fake, info, debugger, {
        for i in 0..4 {
            let view = debugger
                .set_breakpoint(addr(0x401000 + i * 8), None, hw_spec())
                .unwrap();
            assert!(matches!(
                view.trap,
                Trap::Hardware {
                    register: Some(_),
                    ..
                }
            ));
        }

        let fifth = addr(0x402000);
        let err = debugger.set_breakpoint(fifth, None, hw_spec()).unwrap_err();
        assert!(matches!(err, Error::NoFreeRegister));
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(
            debugger.breakpoints(BreakpointKind::Hardware).unwrap().len(),
            4
        );

        debugger
            .disable_breakpoint(BreakpointKind::Hardware, addr(0x401008).into())
            .unwrap();
        let view = debugger.set_breakpoint(fifth, None, hw_spec()).unwrap();
        assert!(matches!(
            view.trap,
            Trap::Hardware {
                register: Some(DebugRegisterNumber::DR1),
                ..
            }
        ));
        assert_eq!(
            fake.calls().last(),
            Some(&Call::InstallHardware(fifth, DebugRegisterNumber::DR1))
        );
        assert!(!info.changes.lock().unwrap().is_empty());
    });
}

#[test]
fn test_hardware_breakpoint_hit() {
    debugger_env!(fake, info, debugger, {
        let spec = TrapSpec::Hardware {
            condition: BreakCondition::DataWrites,
            size: BreakSize::Bytes4,
        };
        let err = debugger
            .set_breakpoint(addr(0x601002), None, spec)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        debugger.set_breakpoint(addr(0x601000), None, spec).unwrap();
        fake.push(DebugEvent::HardwareBreakpoint(DebugRegisterNumber::DR0));
        debugger.run().unwrap();
        match debugger.wait_for_stop().unwrap() {
            StopReason::Breakpoint(view) => {
                assert_eq!(view.kind, BreakpointKind::Hardware);
                assert_eq!(view.addr, addr(0x601000));
            }
            other => panic!("unexpected stop: {other:?}"),
        }
        assert_eq!(info.stops.lock().unwrap().len(), 2);
    });
}

#[test]
fn test_memory_breakpoint_restore() {
    debugger_env!(fake, info, debugger, {
        let spec = TrapSpec::Memory {
            access: MemoryAccess::WRITE,
            restore: true,
        };
        let view = debugger.set_breakpoint(addr(0x10800), None, spec).unwrap();
        assert_eq!(view.addr, addr(0x10000));
        assert!(matches!(
            view.trap,
            Trap::Memory {
                region_size: 0x1000,
                ..
            }
        ));

        fake.push(DebugEvent::MemoryBreakpoint(addr(0x10804)));
        debugger.run().unwrap();
        let StopReason::Breakpoint(hit) = debugger.wait_for_stop().unwrap() else {
            panic!("breakpoint stop expected");
        };
        assert_eq!(hit.number, view.number);

        debugger.run().unwrap();
        assert_eq!(
            fake.calls(),
            vec![
                Call::InstallMemory(addr(0x10000), 0x1000),
                Call::RemoveMemory(addr(0x10000), 0x1000),
                Call::InstallMemory(addr(0x10000), 0x1000),
            ]
        );
        assert!(info.changes.lock().unwrap().contains(&(BreakpointChange::Hit, 0x10000)));
    });
}

#[test]
fn test_memory_breakpoint_one_shot() {
    debugger_env!(fake, info, debugger, {
        let spec = TrapSpec::Memory {
            access: MemoryAccess::all(),
            restore: false,
        };
        debugger.set_breakpoint(addr(0x10000), None, spec).unwrap();

        fake.push(DebugEvent::MemoryBreakpoint(addr(0x10010)));
        debugger.run().unwrap();
        assert!(matches!(
            debugger.wait_for_stop().unwrap(),
            StopReason::Breakpoint(_)
        ));
        assert!(debugger
            .breakpoints(BreakpointKind::Memory)
            .unwrap()
            .is_empty());
        assert!(info.changes.lock().unwrap().contains(&(BreakpointChange::Hit, 0x10000)));
    });
}

#[test]
fn test_engine_failure_rolls_back() {
    debugger_env!(fake, info, debugger, {
        fake.state().engine_fails = true;
        let err = debugger
            .set_software_breakpoint(addr(0x401000), None, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineFailure);
        fake.state().engine_fails = false;

        assert!(debugger
            .breakpoints(BreakpointKind::Software)
            .unwrap()
            .is_empty());
        debugger
            .set_software_breakpoint(addr(0x401000), None, false)
            .unwrap();
        assert!(info
            .changes
            .lock()
            .unwrap()
            .contains(&(BreakpointChange::Deleted, 0x401000)));
    });
}

#[test]
fn test_duplicate_and_unknown() {
    debugger_env!(fake, info, debugger, {
        debugger
            .set_software_breakpoint(addr(0x401000), Some("a"), false)
            .unwrap();
        let err = debugger
            .set_software_breakpoint(addr(0x401000), None, false)
            .unwrap_err();
        assert!(err.is_informational());

        let err = debugger
            .set_software_breakpoint(addr(0x401001), Some("a"), false)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName(..)));

        let err = debugger
            .set_software_breakpoint(addr(0x900000), None, false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));

        let err = debugger
            .delete_breakpoint(BreakpointKind::Software, Selector::from_ident("nope"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(fake.calls().len(), 1);
        assert_eq!(info.changes.lock().unwrap().len(), 2);
    });
}

#[test]
fn test_bulk_operations() {
    debugger_env!(fake, info, debugger, {
        for i in 0..3 {
            debugger
                .set_software_breakpoint(addr(0x401000 + i), None, false)
                .unwrap();
        }
        debugger
            .disable_breakpoint(BreakpointKind::Software, addr(0x401001).into())
            .unwrap();

        let outcome = debugger
            .disable_all_breakpoints(BreakpointKind::Software)
            .unwrap();
        assert_eq!((outcome.changed, outcome.unchanged), (2, 1));

        let outcome = debugger
            .enable_all_breakpoints(BreakpointKind::Software)
            .unwrap();
        assert_eq!(outcome.into_result().unwrap(), (3, 0));

        let outcome = debugger
            .delete_all_breakpoints(BreakpointKind::Software)
            .unwrap();
        assert_eq!(outcome.changed, 3);
        assert!(debugger
            .breakpoints(BreakpointKind::Software)
            .unwrap()
            .is_empty());
        assert!(fake.calls().len() > 6);
        assert!(!info.changes.lock().unwrap().is_empty());
    });
}
