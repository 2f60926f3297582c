use crate::common::{addr, Call};
use crate::debugger_env;
use trapctl::debugger::engine::{DebugEvent, Resume};
use trapctl::debugger::execution::SteppingMode;
use trapctl::debugger::{
    BreakpointKind, Error, ExceptionPolicy, SessionState, SoftwareTrap, StopReason,
};

#[test]
fn test_single_step() {
    debugger_env!(fake, info, debugger, {
        debugger.single_step(3).unwrap();
        assert_eq!(debugger.wait_for_stop().unwrap(), StopReason::Step(addr(3)));

        let steps = fake.resumes().iter().filter(|r| r.step).count();
        assert_eq!(steps, 3);
        assert_eq!(
            debugger.controller().unwrap().state().stepping(),
            SteppingMode::None
        );
        assert_eq!(debugger.state(), SessionState::Stopped);

        // zero means one instruction
        debugger.single_step(0).unwrap();
        assert_eq!(debugger.wait_for_stop().unwrap(), StopReason::Step(addr(4)));
        assert_eq!(info.stops.lock().unwrap().len(), 3);
    });
}

#[test]
fn test_step_into() {
    debugger_env!(fake, info, debugger, {
        fake.state().pc = 0x401000;
        debugger.step_into().unwrap();
        assert_eq!(
            debugger.wait_for_stop().unwrap(),
            StopReason::Step(addr(0x401001))
        );
        assert_eq!(fake.resumes(), vec![Resume::step()]);
        assert!(info.started.lock().unwrap().is_some());
    });
}

#[test]
fn test_step_over_call() {
    debugger_env!(fake, info, debugger, {
        fake.state().call_return_site = Some(addr(0x401005));
        debugger.step_over().unwrap();
        assert_eq!(
            fake.calls(),
            vec![Call::InstallSoftware(addr(0x401005), SoftwareTrap::Int3Short)]
        );
        assert_eq!(fake.resumes(), vec![Resume::run()]);

        fake.push(DebugEvent::Breakpoint(addr(0x401005)));
        assert_eq!(
            debugger.wait_for_stop().unwrap(),
            StopReason::Step(addr(0x401005))
        );
        assert_eq!(
            fake.calls().last(),
            Some(&Call::RemoveSoftware(addr(0x401005), vec![0x55]))
        );
        // transient trap is not a user breakpoint
        assert!(debugger
            .breakpoints(BreakpointKind::Software)
            .unwrap()
            .is_empty());
        assert!(info.changes.lock().unwrap().is_empty());
    });
}

#[test]
fn test_step_over_call_with_breakpoint_at_return_site() {
    debugger_env!(fake, info, debugger, {
        debugger
            .set_software_breakpoint(addr(0x401005), Some("after_call"), false)
            .unwrap();
        fake.state().call_return_site = Some(addr(0x401005));
        debugger.step_over().unwrap();

        // the user breakpoint traps the return site, callee runs in full
        assert_eq!(fake.resumes(), vec![Resume::run()]);
        assert_eq!(
            fake.calls(),
            vec![Call::InstallSoftware(addr(0x401005), SoftwareTrap::Int3Short)]
        );

        fake.push(DebugEvent::Breakpoint(addr(0x401005)));
        match debugger.wait_for_stop().unwrap() {
            StopReason::Breakpoint(view) => assert_eq!(view.addr, addr(0x401005)),
            other => panic!("unexpected stop: {other:?}"),
        }
        assert_eq!(
            debugger.controller().unwrap().state().stepping(),
            SteppingMode::None
        );
        assert_eq!(info.stops.lock().unwrap().len(), 2);
    });
}

#[test]
fn test_step_over_plain_instruction() {
    debugger_env!(fake, info, debugger, {
        debugger.step_over().unwrap();
        assert_eq!(debugger.wait_for_stop().unwrap(), StopReason::Step(addr(1)));
        assert!(fake.calls().is_empty());
        assert_eq!(info.stops.lock().unwrap().len(), 2);
    });
}

#[test]
fn test_step_over_stops_at_inner_breakpoint() {
    debugger_env!(fake, info, debugger, {
        debugger
            .set_software_breakpoint(addr(0x402000), None, false)
            .unwrap();
        fake.state().call_return_site = Some(addr(0x401005));
        debugger.step_over().unwrap();

        fake.push(DebugEvent::Breakpoint(addr(0x402000)));
        assert!(matches!(
            debugger.wait_for_stop().unwrap(),
            StopReason::Breakpoint(_)
        ));
        // transient trap removed on any stop
        assert_eq!(
            fake.calls().last(),
            Some(&Call::RemoveSoftware(addr(0x401005), vec![0x55]))
        );
        assert_eq!(info.stops.lock().unwrap().len(), 2);
    });
}

#[test]
fn test_run_to_return() {
    debugger_env!(fake, info, debugger, {
        fake.state().return_address = Some(addr(0x401100));
        debugger.run_to_return().unwrap();
        fake.push(DebugEvent::Breakpoint(addr(0x401100)));
        assert_eq!(
            debugger.wait_for_stop().unwrap(),
            StopReason::Step(addr(0x401100))
        );
        assert_eq!(
            fake.calls(),
            vec![
                Call::InstallSoftware(addr(0x401100), SoftwareTrap::Int3Short),
                Call::RemoveSoftware(addr(0x401100), vec![0x55]),
            ]
        );
        assert_eq!(info.stops.lock().unwrap().len(), 2);
    });
}

#[test]
fn test_run_to_return_unknown_address() {
    debugger_env!(fake, info, debugger, {
        debugger.run_to_return().unwrap();
        assert_eq!(fake.resumes(), vec![Resume::run()]);
        assert!(fake.calls().is_empty());

        fake.push(DebugEvent::Exited(3));
        assert!(matches!(
            debugger.wait_for_stop(),
            Err(Error::ProcessExit(3))
        ));
        assert_eq!(info.stops.lock().unwrap().len(), 1);
    });
}

#[test]
fn test_run_while_running() {
    debugger_env!(fake, info, debugger, {
        debugger.run().unwrap();
        assert_eq!(debugger.state(), SessionState::Running);

        assert!(matches!(debugger.run(), Err(Error::AlreadyRunning)));
        assert!(matches!(debugger.single_step(2), Err(Error::AlreadyRunning)));
        assert_eq!(
            debugger.controller().unwrap().state().stepping(),
            SteppingMode::None
        );
        assert!(matches!(
            debugger.breakpoints(BreakpointKind::Software),
            Err(Error::NotStopped)
        ));
        assert!(matches!(
            debugger.skip_next_exception(),
            Err(Error::NotStopped)
        ));

        debugger.pause().unwrap();
        assert_eq!(debugger.wait_for_stop().unwrap(), StopReason::Paused);
        assert!(matches!(debugger.pause(), Err(Error::NotRunning)));
        assert_eq!(fake.resumes(), vec![Resume::run()]);
        assert_eq!(info.stops.lock().unwrap().last(), Some(&StopReason::Paused));
    });
}

#[test]
fn test_exception_policy() {
    debugger_env!(fake, info, debugger, {
        fake.push(DebugEvent::Exception(11));
        debugger.run().unwrap();
        assert_eq!(debugger.wait_for_stop().unwrap(), StopReason::Exception(11));

        // swallowed by default
        debugger.run().unwrap();
        assert_eq!(fake.resumes().last(), Some(&Resume::run()));

        fake.push(DebugEvent::Exception(11));
        assert_eq!(debugger.wait_for_stop().unwrap(), StopReason::Exception(11));
        debugger.set_exception_policy(ExceptionPolicy::NotHandled);
        debugger.run().unwrap();
        assert_eq!(
            fake.resumes().last(),
            Some(&Resume {
                step: false,
                deliver: Some(11),
            })
        );

        fake.push(DebugEvent::Exception(11));
        assert_eq!(debugger.wait_for_stop().unwrap(), StopReason::Exception(11));
        debugger.skip_next_exception().unwrap();
        debugger.run().unwrap();
        assert_eq!(fake.resumes().last(), Some(&Resume::run()));
        assert!(info.stops.lock().unwrap().len() >= 4);
    });
}

#[test]
fn test_skip_next_exception() {
    debugger_env!(fake, info, debugger, {
        debugger.skip_next_exception().unwrap();
        fake.push(DebugEvent::Exception(8));
        fake.push(DebugEvent::Exited(0));
        debugger.run().unwrap();

        assert!(matches!(
            debugger.wait_for_stop(),
            Err(Error::ProcessExit(0))
        ));
        let stops = info.stops.lock().unwrap();
        assert!(!stops.iter().any(|s| matches!(s, StopReason::Exception(_))));
    });
}
