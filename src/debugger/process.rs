use crate::debugger::error::Error;
use crate::debugger::error::Error::{Ptrace, Waitpid};
use log::debug;
use object::Object;
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::ptrace::Options;
use nix::sys::signal::SIGSTOP;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::ErrorKind;
use std::iter;
use std::marker::PhantomData;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use sysinfo::{ProcessRefreshKind, RefreshKind, System};

/// Instruction set of a binary or a process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Architecture {
    X86,
    X86_64,
    Other(String),
}

impl Architecture {
    /// Return the architecture this debugger is built for.
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Architecture::X86_64
        } else if cfg!(target_arch = "x86") {
            Architecture::X86
        } else {
            Architecture::Other(std::env::consts::ARCH.to_string())
        }
    }

    /// Read architecture from an executable file header.
    pub fn of_file(path: &Path) -> Result<Self, Error> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::TargetNotFound(path.to_path_buf()))
            }
            Err(e) => return Err(Error::IO(e)),
        };
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let object = object::File::parse(&*mmap)
            .map_err(|_| Error::UnsupportedBinary(path.to_path_buf()))?;

        Ok(match object.architecture() {
            object::Architecture::X86_64 => Architecture::X86_64,
            object::Architecture::I386 | object::Architecture::X86_64_X32 => Architecture::X86,
            other => Architecture::Other(format!("{other:?}").to_lowercase()),
        })
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Architecture::X86 => f.write_str("x86"),
            Architecture::X86_64 => f.write_str("x86-64"),
            Architecture::Other(name) => f.write_str(name),
        }
    }
}

/// Program to debug.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchTarget {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl LaunchTarget {
    pub fn new<I: Into<String>>(
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = I>,
    ) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
        }
    }

    pub fn with_cwd(self, cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..self
        }
    }
}

/// Return executable path of a running process.
pub fn process_exe(pid: Pid) -> Result<PathBuf, Error> {
    let sys = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new().with_exe(sysinfo::UpdateKind::Always)),
    );
    let process = sys
        .process(sysinfo::Pid::from_u32(pid.as_raw() as u32))
        .ok_or(Error::ProcessNotFound(pid))?;

    match process.exe() {
        Some(exe) => Ok(exe.to_path_buf()),
        None => fs::read_link(format!("/proc/{pid}/exe")).map_err(Error::IO),
    }
}

/// Process state.
pub trait State {}

/// Process running and attached with `ptrace` system call.
pub struct Installed;

impl State for Installed {}

/// Process prepare for instantiation by a `fork` call.
pub struct Template;

impl State for Template {}

fn seize_options() -> Options {
    Options::PTRACE_O_TRACECLONE
        .union(Options::PTRACE_O_TRACEEXEC)
        .union(Options::PTRACE_O_TRACEEXIT)
}

/// Process attached to tracer with ptrace.
pub struct Child<S: State> {
    target: LaunchTarget,
    pid: Option<Pid>,
    /// Threads observed at the time of attaching.
    threads: Vec<Pid>,
    _p: PhantomData<S>,
}

impl Child<Template> {
    /// Create new process, but dont start it.
    pub fn new(target: LaunchTarget) -> Child<Template> {
        Self {
            target,
            pid: None,
            threads: vec![],
            _p: PhantomData,
        }
    }

    /// Instantiate process by `fork()` system call with caller as a parent process.
    /// The child is seized right before `exec`, first debug event of it is `PTRACE_EVENT_EXEC`.
    pub fn install(&self) -> Result<Child<Installed>, Error> {
        let mut debugee_cmd = Command::new(&self.target.program);
        let debugee_cmd = debugee_cmd.args(&self.target.args);
        if let Some(cwd) = self.target.cwd.as_deref() {
            debugee_cmd.current_dir(cwd);
        }

        unsafe {
            debugee_cmd.pre_exec(move || {
                sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                Ok(())
            });
        }

        match unsafe { fork() }.map_err(|e| Error::Syscall("fork", e))? {
            ForkResult::Parent { child: pid } => {
                waitpid(pid, Some(WaitPidFlag::WSTOPPED)).map_err(Waitpid)?;
                sys::ptrace::seize(pid, seize_options()).map_err(Ptrace)?;
                // seize of a stopped process reports a group-stop
                waitpid(pid, Some(WaitPidFlag::__WALL)).map_err(Waitpid)?;
                sys::ptrace::cont(pid, None).map_err(Ptrace)?;
                debug!(target: "tracer", "debugee process {pid} installed");

                Ok(Child {
                    target: self.target.clone(),
                    pid: Some(pid),
                    threads: vec![pid],
                    _p: PhantomData,
                })
            }
            ForkResult::Child => {
                _ = sys::signal::raise(SIGSTOP);
                let err = debugee_cmd.exec();
                eprintln!("run debugee fail with: {err}");
                std::process::exit(127);
            }
        }
    }
}

impl Child<Installed> {
    /// Attach to a running process, all its threads are seized and interrupted.
    pub fn from_external(pid: Pid) -> Result<Self, Error> {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new()),
        );
        let external_process = sys
            .process(sysinfo::Pid::from_u32(pid.as_raw() as u32))
            .ok_or(Error::ProcessNotFound(pid))?;
        let program = process_exe(pid)?;

        let mut interrupted_threads = HashSet::new();
        // two interrupt rounds, threads may be created during the first one
        for _ in 0..2 {
            let threads: Vec<Pid> = match external_process.tasks() {
                Some(tasks) => iter::once(pid)
                    .chain(tasks.iter().map(|tid| Pid::from_raw(tid.as_u32() as i32)))
                    .collect(),
                None => vec![pid],
            };
            let threads: Vec<Pid> = threads
                .into_iter()
                .filter(|t| !interrupted_threads.contains(t))
                .collect();

            for tid in &threads {
                sys::ptrace::seize(*tid, seize_options()).map_err(Ptrace)?;
            }
            for tid in &threads {
                sys::ptrace::interrupt(*tid).map_err(Ptrace)?;
            }
            for tid in &threads {
                waitpid(*tid, Some(WaitPidFlag::__WALL)).map_err(Waitpid)?;
            }

            interrupted_threads.extend(threads);
        }
        debug!(target: "tracer", "attached to {pid}, threads: {interrupted_threads:?}");

        Ok(Self {
            target: LaunchTarget::new(program, external_process.cmd().iter().skip(1).cloned()),
            pid: Some(pid),
            threads: interrupted_threads.into_iter().collect(),
            _p: PhantomData,
        })
    }

    /// Return running process pid.
    pub fn pid(&self) -> Pid {
        self.pid.unwrap_or_else(|| Pid::from_raw(0))
    }

    /// Return threads known at installation time.
    pub fn threads(&self) -> &[Pid] {
        &self.threads
    }
}

impl<S: State> Child<S> {
    pub fn program(&self) -> &Path {
        &self.target.program
    }
}
