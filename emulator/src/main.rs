use clap::{Parser, ValueEnum};
use nyuzi_emulator::cosim::{Cosimulation, HALTED_MARKER};
use nyuzi_emulator::interrupt_pipe::InterruptPipe;
use nyuzi_emulator::scheduler::SchedulePolicy;
use nyuzi_emulator::{loader, Core, CoreConfig, SimError};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Run the program on its own.
    Normal,
    /// Check against a reference trace read from stdin.
    Cosim,
}

#[derive(Clone, Debug)]
struct DumpRegion {
    path: PathBuf,
    start: u32,
    length: u32,
}

/// Decimal, or hex with a `0x` prefix.
fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let value = parse_number(s)?;
    u32::try_from(value).map_err(|_| format!("'{}' does not fit in 32 bits", s))
}

fn parse_size(s: &str) -> Result<usize, String> {
    parse_u32(s).map(|v| v as usize)
}

fn parse_dump(s: &str) -> Result<DumpRegion, String> {
    let parts: Vec<&str> = s.split(',').collect();
    match parts.as_slice() {
        [path, start, length] => Ok(DumpRegion {
            path: PathBuf::from(path),
            start: parse_u32(start)?,
            length: parse_u32(length)?,
        }),
        _ => Err(format!("expected FILE,START,LENGTH, got '{}'", s)),
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Nyuzi instruction set emulator", long_about = None)]
struct Args {
    /// Execution mode
    #[arg(short = 'm', long, value_enum, default_value_t = Mode::Normal)]
    mode: Mode,

    /// Print every committed register and memory write
    #[arg(short, long)]
    verbose: bool,

    /// Physical memory size in bytes
    #[arg(short = 'c', long = "memory-size", value_parser = parse_size, default_value = "0x1000000")]
    memory_size: usize,

    /// Number of hardware threads
    #[arg(short = 't', long, default_value_t = 4, value_parser = clap::value_parser!(u32).range(1..=32))]
    threads: u32,

    /// Thread schedule: round-robin, or a comma separated thread sequence
    #[arg(long, default_value = "round-robin")]
    schedule: SchedulePolicy,

    /// Write memory to a file on exit: FILE,START,LENGTH
    #[arg(short = 'd', long = "dump", value_parser = parse_dump)]
    dump: Option<DumpRegion>,

    /// Pipe to read interrupt requests from, one byte per interrupt
    #[arg(short = 'i', long = "interrupt-pipe")]
    interrupt_pipe: Option<PathBuf>,

    /// Pipe that receives bytes written to the host interrupt register
    #[arg(short = 'o', long = "host-pipe")]
    host_pipe: Option<PathBuf>,

    /// Stop after this many instructions
    #[arg(long, value_parser = parse_number)]
    max_steps: Option<u64>,

    /// Program image (ELF or hex)
    image: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), SimError> {
    let image = loader::load_file(&args.image)?;
    let mut core = Core::new(CoreConfig {
        memory_size: args.memory_size,
        threads: args.threads as usize,
        schedule: args.schedule.clone(),
        record_events: args.verbose || args.mode == Mode::Cosim,
        ..CoreConfig::default()
    });
    core.load_image(&image)?;
    log::info!(
        "loaded {} at entry {:#010x}, {} threads, schedule {}",
        args.image.display(),
        image.entry,
        core.thread_count(),
        core.schedule()
    );

    let result = match args.mode {
        Mode::Normal => run_normal(&mut core, args),
        Mode::Cosim => {
            let stdin = io::stdin();
            let stdout = io::stdout();
            Cosimulation::new(&mut core).run(stdin.lock(), stdout.lock())
        }
    };
    if let Err(err) = result {
        eprintln!("{}", core.dump_state());
        return Err(err);
    }

    if let Some(dump) = &args.dump {
        let bytes = core.memory.dram.read_bytes(dump.start, dump.length as usize)?;
        std::fs::write(&dump.path, bytes)?;
        log::info!(
            "dumped {:#x} bytes at {:#010x} to {}",
            dump.length,
            dump.start,
            dump.path.display()
        );
    }
    Ok(())
}

fn run_normal(core: &mut Core, args: &Args) -> Result<(), SimError> {
    let interrupts = args
        .interrupt_pipe
        .as_deref()
        .map(InterruptPipe::open)
        .transpose()?;
    let mut host_pipe = match &args.host_pipe {
        Some(path) => Some(OpenOptions::new().write(true).open(path)?),
        None => None,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut steps = 0u64;

    loop {
        if let Some(pipe) = &interrupts {
            while let Some(byte) = pipe.poll() {
                core.raise_interrupt(byte as usize % core.thread_count())?;
            }
        }

        if args.max_steps.map_or(false, |limit| steps >= limit) {
            log::info!("stopping after {} instructions", steps);
            break;
        }

        let ran = core.step()?;

        if args.verbose {
            for event in core.take_events() {
                writeln!(out, "{}", event)?;
            }
        }
        let serial = core.take_serial_output();
        if !serial.is_empty() {
            out.write_all(&serial)?;
            out.flush()?;
        }
        let bytes = core.take_host_interrupts();
        if let Some(pipe) = host_pipe.as_mut() {
            if !bytes.is_empty() {
                pipe.write_all(&bytes)?;
                pipe.flush()?;
            }
        }

        if ran.is_none() {
            if args.verbose {
                writeln!(out, "{}", HALTED_MARKER)?;
            }
            break;
        }
        steps += 1;
    }

    out.flush()?;
    log::info!(
        "{} instructions retired in {} cycles",
        core.threads().iter().map(|t| t.retired).sum::<u64>(),
        core.cycle_count()
    );
    Ok(())
}
