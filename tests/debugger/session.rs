use crate::common::{
    addr, Call, Fake, FakePlatform, Scripted, TestHooks, TestInfo, DEBUGEE_PID, MISSING_APP,
    X86_APP,
};
use crate::debugger_env;
use nix::unistd::Pid;
use trapctl::debugger::engine::DebugEvent;
use trapctl::debugger::{
    Architecture, BreakpointKind, Debugger, Error, ErrorKind, LaunchTarget, SessionEnd,
    SessionState, SoftwareTrap, StopReason,
};

fn debugger(fake: &Fake, info: &TestInfo) -> Debugger {
    Debugger::new(FakePlatform::new(fake.clone()), TestHooks::new(info.clone()))
}

#[test]
fn test_start_missing_target() {
    let fake = Fake::default();
    let mut debugger = debugger(&fake, &TestInfo::default());
    let err = debugger
        .start(LaunchTarget::new(MISSING_APP, Vec::<String>::new()))
        .unwrap_err();
    assert!(matches!(err, Error::TargetNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!err.is_fatal());
    assert_eq!(debugger.state(), SessionState::Idle);
}

#[test]
fn test_start_architecture_mismatch() {
    let fake = Fake::default();
    let mut debugger = debugger(&fake, &TestInfo::default());
    let err = debugger
        .start(LaunchTarget::new(X86_APP, Vec::<String>::new()))
        .unwrap_err();
    match err {
        Error::ArchitectureMismatch { expected, found } => {
            assert_eq!(expected, Architecture::X86_64);
            assert_eq!(found, Architecture::X86);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(debugger.state(), SessionState::Idle);
}

#[test]
fn test_attach_architecture_mismatch() {
    let fake = Fake::default();
    let mut debugger = Debugger::new(
        FakePlatform::with_process_arch(fake.clone(), Architecture::X86),
        TestHooks::default(),
    );
    let err = debugger.attach(Pid::from_raw(DEBUGEE_PID)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ArchitectureMismatch);
    assert_eq!(debugger.state(), SessionState::Idle);
    assert_eq!(debugger.pid(), None);
    assert!(matches!(debugger.run(), Err(Error::NotDebugging)));
}

#[test]
fn test_attach() {
    let fake = Fake::default();
    let info = TestInfo::default();
    let mut debugger = debugger(&fake, &info);
    debugger.attach(Pid::from_raw(DEBUGEE_PID)).unwrap();
    assert_eq!(debugger.wait_for_stop().unwrap(), StopReason::Entry);
    assert_eq!(debugger.state(), SessionState::Stopped);
    assert_eq!(debugger.pid(), Some(Pid::from_raw(DEBUGEE_PID)));
    assert_eq!(*info.started.lock().unwrap(), Some(Pid::from_raw(DEBUGEE_PID)));
}

#[test]
fn test_already_debugging() {
    debugger_env!(fake, info, debugger, {
        let err = debugger
            .start(LaunchTarget::new("/apps/hello", Vec::<String>::new()))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyDebugging));
        assert_eq!(err.kind(), ErrorKind::SessionStateError);

        let err = debugger.attach(Pid::from_raw(1)).unwrap_err();
        assert!(matches!(err, Error::AlreadyDebugging));
        assert_eq!(debugger.state(), SessionState::Stopped);
        assert!(fake.calls().is_empty());
        assert!(info.ends.lock().unwrap().is_empty());
    });
}

#[test]
fn test_stop_while_stopped() {
    debugger_env!(fake, info, debugger, {
        debugger.stop().unwrap();
        assert_eq!(debugger.state(), SessionState::Idle);
        assert!(fake.state().terminated);
        assert_eq!(*info.ends.lock().unwrap(), vec![SessionEnd::Terminated]);
        assert!(matches!(debugger.stop(), Err(Error::NotDebugging)));
    });
}

#[test]
fn test_stop_while_running() {
    debugger_env!(fake, info, debugger, {
        debugger.run().unwrap();
        debugger.stop().unwrap();
        assert_eq!(debugger.state(), SessionState::Idle);
        assert!(fake.state().terminated);
        assert_eq!(*info.ends.lock().unwrap(), vec![SessionEnd::Terminated]);
        assert_eq!(debugger.pid(), None);
    });
}

#[test]
fn test_detach() {
    debugger_env!(fake, info, debugger, {
        debugger
            .set_software_breakpoint(addr(0x401000), None, false)
            .unwrap();
        debugger.detach().unwrap();

        assert!(fake.state().detached);
        assert!(!fake.state().terminated);
        assert_eq!(
            fake.calls().last(),
            Some(&Call::RemoveSoftware(addr(0x401000), vec![0x55]))
        );
        // no instruction is executed on the way out
        assert!(fake.resumes().is_empty());
        assert_eq!(debugger.state(), SessionState::Idle);
        assert_eq!(*info.ends.lock().unwrap(), vec![SessionEnd::Detached]);
    });
}

#[test]
fn test_detach_failure_keeps_session() {
    debugger_env!(fake, info, debugger, {
        debugger
            .set_software_breakpoint(addr(0x401000), None, false)
            .unwrap();
        fake.state().detach_fails = true;

        let err = debugger.detach().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineFailure);
        assert_eq!(debugger.state(), SessionState::Stopped);
        assert!(!fake.state().terminated);
        assert!(!fake.state().detached);
        assert!(info.ends.lock().unwrap().is_empty());
        // traps are back in place
        assert_eq!(
            fake.calls(),
            vec![
                Call::InstallSoftware(addr(0x401000), SoftwareTrap::Int3Short),
                Call::RemoveSoftware(addr(0x401000), vec![0x55]),
                Call::InstallSoftware(addr(0x401000), SoftwareTrap::Int3Short),
            ]
        );
        assert!(debugger
            .breakpoint(BreakpointKind::Software, addr(0x401000).into())
            .unwrap()
            .is_some_and(|view| view.enabled));

        debugger.detach().unwrap();
        assert!(fake.state().detached);
        assert!(!fake.state().terminated);
        assert_eq!(*info.ends.lock().unwrap(), vec![SessionEnd::Detached]);
    });
}

#[test]
fn test_detach_while_running() {
    debugger_env!(fake, info, debugger, {
        debugger.run().unwrap();
        let err = debugger.detach().unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidSessionState(SessionState::Running)
        ));
        assert!(!fake.state().detached);
        assert!(info.ends.lock().unwrap().is_empty());
    });
}

#[test]
fn test_session_lost() {
    debugger_env!(fake, info, debugger, {
        fake.push_scripted(Scripted::Fail);
        debugger.run().unwrap();

        let err = debugger.wait_for_stop().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(debugger.state(), SessionState::Idle);
        assert!(matches!(
            info.ends.lock().unwrap().as_slice(),
            [SessionEnd::Lost(_)]
        ));

        let err = debugger.stop().unwrap_err();
        assert!(matches!(err, Error::SessionLost(_)));
        assert_eq!(debugger.state(), SessionState::Idle);
    });
}

#[test]
fn test_restart_after_exit() {
    debugger_env!(fake, info, debugger, {
        fake.push(DebugEvent::Exited(0));
        debugger.run().unwrap();
        assert!(matches!(
            debugger.wait_for_stop(),
            Err(Error::ProcessExit(0))
        ));
        assert_eq!(debugger.state(), SessionState::Idle);
        assert!(matches!(debugger.run(), Err(Error::NotDebugging)));

        debugger
            .start(LaunchTarget::new("/apps/hello", Vec::<String>::new()))
            .unwrap();
        assert_eq!(debugger.wait_for_stop().unwrap(), StopReason::Entry);
        assert_eq!(
            *info.ends.lock().unwrap(),
            vec![SessionEnd::Exited(0)]
        );
    });
}
