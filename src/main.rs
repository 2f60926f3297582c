use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use nix::unistd::Pid;
use std::path::PathBuf;
use trapctl::config::Config;
use trapctl::debugger::linux::LinuxPlatform;
use trapctl::debugger::{
    BreakCondition, BreakSize, BreakpointChange, BreakpointView, Debugger, Error, EventHook,
    LaunchTarget, MemoryAccess, RelocatedAddress, SessionEnd, SoftwareTrap, StopReason, TrapSpec,
};
use trapctl::{tc_info, tc_warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Software breakpoint: ADDR[:short|long|ud2][:ss]
    #[arg(long = "break", value_name = "SPEC")]
    breakpoints: Vec<String>,

    /// Hardware breakpoint: ADDR[:x|w|rw][:1|2|4|8]
    #[arg(long = "hw", value_name = "SPEC")]
    hardware: Vec<String>,

    /// Memory breakpoint: ADDR[:r|w|x|a][:restore]
    #[arg(long = "mem", value_name = "SPEC")]
    memory: Vec<String>,

    /// Execute N instructions after the entry stop.
    #[arg(long, value_name = "N")]
    step: Option<u32>,

    /// Path to configuration file.
    #[arg(long, env = "TRAPCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Don't print progress messages.
    #[arg(short, long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Launch a program under debugger.
    Run {
        program: PathBuf,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Attach to a running process.
    Attach { pid: i32 },
}

/// Prints debugger notifications into stdout.
struct PrintHook;

impl EventHook for PrintHook {
    fn on_breakpoint(&self, change: BreakpointChange, view: &BreakpointView) {
        match change {
            BreakpointChange::Hit => {}
            BreakpointChange::Created => tc_info!(target: "tctl", "new breakpoint {view}"),
            _ => tc_info!(target: "tctl", "breakpoint #{} {change:?}", view.number),
        }
    }

    fn on_resume(&self) {}

    fn on_stop(&self, reason: &StopReason) {
        match reason {
            StopReason::Entry => println!("debugee stopped at entry"),
            StopReason::Breakpoint(view) => println!("hit {view}"),
            StopReason::Step(addr) => println!("step completed at {addr}"),
            StopReason::Paused => println!("paused"),
            StopReason::Exception(signal) => println!("exception, signal {signal}"),
        }
    }

    fn on_session_start(&self, pid: Pid) {
        tc_info!(target: "tctl", "debugee pid {pid}");
    }

    fn on_session_end(&self, end: &SessionEnd) {
        match end {
            SessionEnd::Exited(code) => println!("debugee exited with code {code}"),
            SessionEnd::Detached => println!("detached"),
            SessionEnd::Terminated => println!("debugee killed"),
            SessionEnd::Lost(reason) => eprintln!("debug session lost: {reason}"),
        }
    }
}

/// Split `ADDR[:opt..]` into address and options.
fn split_spec(spec: &str) -> anyhow::Result<(RelocatedAddress, Vec<&str>)> {
    let mut parts = spec.split(':');
    let addr = parts.next().unwrap_or_default();
    let addr: RelocatedAddress = addr
        .parse()
        .with_context(|| format!("invalid address in `{spec}`"))?;
    Ok((addr, parts.collect()))
}

fn software_spec(spec: &str, default: SoftwareTrap) -> anyhow::Result<(RelocatedAddress, TrapSpec)> {
    let (addr, opts) = split_spec(spec)?;
    let mut variant = default;
    let mut singleshot = false;
    for opt in opts {
        match opt {
            "ss" => singleshot = true,
            other => {
                variant = other
                    .parse()
                    .map_err(|_| Error::InvalidTrapType(other.to_string()))?
            }
        }
    }
    Ok((addr, TrapSpec::Software { variant, singleshot }))
}

fn hardware_spec(spec: &str) -> anyhow::Result<(RelocatedAddress, TrapSpec)> {
    let (addr, opts) = split_spec(spec)?;
    let mut condition = BreakCondition::default();
    let mut size = BreakSize::default();
    for opt in opts {
        match opt.parse::<u8>() {
            Ok(bytes) => size = BreakSize::try_from(bytes)?,
            Err(_) => {
                condition = opt
                    .parse()
                    .map_err(|_| Error::InvalidTrapType(opt.to_string()))?
            }
        }
    }
    Ok((addr, TrapSpec::Hardware { condition, size }))
}

fn memory_spec(spec: &str) -> anyhow::Result<(RelocatedAddress, TrapSpec)> {
    let (addr, opts) = split_spec(spec)?;
    let mut access = MemoryAccess::default();
    let mut restore = false;
    for opt in opts {
        match opt {
            "restore" => restore = true,
            other => access = other.parse()?,
        }
    }
    Ok((addr, TrapSpec::Memory { access, restore }))
}

fn set_breakpoints(debugger: &Debugger, args: &Args) -> anyhow::Result<()> {
    let default = debugger.default_software_trap();
    let specs = args
        .breakpoints
        .iter()
        .map(|s| software_spec(s, default))
        .chain(args.hardware.iter().map(|s| hardware_spec(s)))
        .chain(args.memory.iter().map(|s| memory_spec(s)));

    for spec in specs {
        let (addr, spec) = spec?;
        match debugger.set_breakpoint(addr, None, spec) {
            Ok(_) => {}
            Err(e) if e.is_informational() => tc_warn!(target: "tctl", "{e}"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Drive debugee until it exits or the user interrupts it.
fn debug_loop(debugger: &Debugger, step: Option<u32>) -> anyhow::Result<bool> {
    let mut step = step;
    loop {
        let result = match step.take() {
            Some(count) => debugger.single_step(count),
            None => debugger.run(),
        };
        result?;

        match debugger.wait_for_stop() {
            Ok(StopReason::Paused) => return Ok(true),
            Ok(_) => {}
            Err(Error::ProcessExit(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.quiet {
        trapctl::log::disable();
    }

    let config = Config::load(args.config.as_deref());
    let platform = LinuxPlatform::new(config.quiet_signals.clone());
    let mut debugger = Debugger::new(platform, PrintHook);
    debugger.set_default_software_trap(config.breakpoint_type);
    debugger.set_exception_policy(config.exception_policy);

    match &args.command {
        Command::Run { program, cwd, args } => {
            let mut target = LaunchTarget::new(program, args.iter().cloned());
            if let Some(cwd) = cwd {
                target = target.with_cwd(cwd);
            }
            debugger.start(target)?;
        }
        Command::Attach { pid } => debugger.attach(Pid::from_raw(*pid))?,
    }

    match debugger.wait_for_stop()? {
        StopReason::Entry => {}
        other => bail!("unexpected first stop: {other:?}"),
    }
    set_breakpoints(&debugger, &args)?;

    let controller = debugger.controller()?.clone();
    ctrlc::set_handler(move || {
        if let Err(e) = controller.pause() {
            tc_warn!(target: "tctl", "pause: {e}");
        }
    })
    .map_err(|e| anyhow!("set ctrl-c handler: {e}"))?;

    if debug_loop(&debugger, args.step)? {
        if config.kill_on_stop {
            debugger.stop()?;
        } else {
            debugger.detach()?;
        }
    }
    Ok(())
}
