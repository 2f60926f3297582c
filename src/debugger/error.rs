use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::BreakpointKind;
use crate::debugger::process::Architecture;
use crate::debugger::session::SessionState;
use nix::unistd::Pid;
use std::num::ParseIntError;
use std::path::PathBuf;

/// Error taxonomy, every [`Error`] belongs to exactly one kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed address, size or name.
    InvalidArgument,
    /// No such breakpoint, process or file.
    NotFound,
    /// Idempotency signal, informational.
    AlreadyExists,
    /// No free hardware register.
    ResourceExhausted,
    /// Operation requires a stopped debuggee but it is running, or vice versa.
    PreconditionFailed,
    /// Trap engine or OS primitive rejected the operation.
    EngineFailure,
    /// Target and debugger bitness mismatch.
    ArchitectureMismatch,
    /// Operation is invalid in current session state.
    SessionStateError,
    /// Session is gone, fatal.
    SessionLost,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("multiple errors {0:?}")]
    MultipleErrors(Vec<Self>),

    // --------------------------------- invalid arguments -----------------------------------------
    #[error("invalid address: {0}")]
    ParseAddress(#[from] ParseIntError),
    #[error("address {0} is not mapped in debugee memory")]
    InvalidAddress(RelocatedAddress),
    #[error("address {addr} not aligned to {size}")]
    MisalignedAddress { addr: RelocatedAddress, size: usize },
    #[error("invalid breakpoint size {0}, expected 1, 2, 4 or 8")]
    InvalidSize(u64),
    #[error("empty breakpoint name")]
    EmptyName,
    #[error("invalid trap type `{0}`")]
    InvalidTrapType(String),

    // --------------------------------- entity not found ------------------------------------------
    #[error("no such {0} breakpoint \"{1}\"")]
    BreakpointNotFound(BreakpointKind, String),
    #[error("file {0} does not exist")]
    TargetNotFound(PathBuf),
    #[error("process pid {0} not found")]
    ProcessNotFound(Pid),

    // --------------------------------- duplicates ------------------------------------------------
    #[error("{0} breakpoint already set at {1}")]
    DuplicateAddress(BreakpointKind, RelocatedAddress),
    #[error("{0} breakpoint with name \"{1}\" already exists")]
    DuplicateName(BreakpointKind, String),

    // --------------------------------- resources -------------------------------------------------
    #[error("you can only set 4 hardware breakpoints")]
    NoFreeRegister,

    // --------------------------------- run state -------------------------------------------------
    #[error("debugee is running, stop it first")]
    NotStopped,
    #[error("program is already running")]
    AlreadyRunning,
    #[error("program is not running")]
    NotRunning,

    // --------------------------------- trap engine and syscall errors ----------------------------
    #[error("trap engine: {0:#}")]
    Engine(anyhow::Error),
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("install disassembler: {0}")]
    DisAsmInit(capstone::Error),
    #[error("instructions disassembly error: {0}")]
    DisAsm(capstone::Error),

    // --------------------------------- architecture ----------------------------------------------
    #[error("target architecture is {found}, use a {found} debugger (this one is {expected})")]
    ArchitectureMismatch {
        expected: Architecture,
        found: Architecture,
    },
    #[error("{0} is not a supported executable")]
    UnsupportedBinary(PathBuf),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- session lifecycle -----------------------------------------
    #[error("already debugging, terminate the current session first")]
    AlreadyDebugging,
    #[error("no active debug session")]
    NotDebugging,
    #[error("operation is invalid while session is {0}")]
    InvalidSessionState(SessionState),
    #[error("debugee process exit with code {0}")]
    ProcessExit(i32),
    #[error("debugee detached")]
    Detached,

    // --------------------------------- fatal -----------------------------------------------------
    #[error("debug session lost: {0}")]
    SessionLost(String),
}

impl Error {
    /// Return a kind of error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IO(_) => ErrorKind::EngineFailure,
            Error::MultipleErrors(_) => ErrorKind::EngineFailure,
            Error::ParseAddress(_) => ErrorKind::InvalidArgument,
            Error::InvalidAddress(_) => ErrorKind::InvalidArgument,
            Error::MisalignedAddress { .. } => ErrorKind::InvalidArgument,
            Error::InvalidSize(_) => ErrorKind::InvalidArgument,
            Error::EmptyName => ErrorKind::InvalidArgument,
            Error::InvalidTrapType(_) => ErrorKind::InvalidArgument,
            Error::UnsupportedBinary(_) => ErrorKind::InvalidArgument,
            Error::ObjParsing(_) => ErrorKind::InvalidArgument,
            Error::BreakpointNotFound(_, _) => ErrorKind::NotFound,
            Error::TargetNotFound(_) => ErrorKind::NotFound,
            Error::ProcessNotFound(_) => ErrorKind::NotFound,
            Error::DuplicateAddress(_, _) => ErrorKind::AlreadyExists,
            Error::DuplicateName(_, _) => ErrorKind::AlreadyExists,
            Error::NoFreeRegister => ErrorKind::ResourceExhausted,
            Error::NotStopped => ErrorKind::PreconditionFailed,
            Error::AlreadyRunning => ErrorKind::PreconditionFailed,
            Error::NotRunning => ErrorKind::PreconditionFailed,
            Error::Engine(_) => ErrorKind::EngineFailure,
            Error::Waitpid(_) => ErrorKind::EngineFailure,
            Error::Ptrace(_) => ErrorKind::EngineFailure,
            Error::Syscall(_, _) => ErrorKind::EngineFailure,
            Error::DisAsmInit(_) => ErrorKind::EngineFailure,
            Error::DisAsm(_) => ErrorKind::EngineFailure,
            Error::ArchitectureMismatch { .. } => ErrorKind::ArchitectureMismatch,
            Error::AlreadyDebugging => ErrorKind::SessionStateError,
            Error::NotDebugging => ErrorKind::SessionStateError,
            Error::InvalidSessionState(_) => ErrorKind::SessionStateError,
            Error::ProcessExit(_) => ErrorKind::SessionStateError,
            Error::Detached => ErrorKind::SessionStateError,
            Error::SessionLost(_) => ErrorKind::SessionLost,
        }
    }

    /// True for idempotency signals that callers must treat as informational.
    pub fn is_informational(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    /// Return a hint to an interface - continue debugging after error or drop the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::SessionLost)
    }
}

/// Convert any trap engine failure into [`Error::Engine`].
pub fn engine_error(e: impl Into<anyhow::Error>) -> Error {
    Error::Engine(e.into())
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}

/// Macro for handle an error lists as warnings.
#[macro_export]
macro_rules! print_warns {
    ($errors:expr) => {
        $errors.iter().for_each(|e| {
            log::warn!(target: "debugger", "{:#}", e);
        })
    };
}
