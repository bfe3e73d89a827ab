use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;

use z80rs::Emulator;

/// Comma-separated inclusive hex address regions: `start-end(,start-end)*`.
#[derive(Clone, Debug, Default)]
struct Regions(Vec<(u16, u16)>);

impl FromStr for Regions {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut regions = Vec::new();
        for part in s.split(',') {
            let (start, end) = part
                .split_once('-')
                .ok_or_else(|| format!("region `{part}` is not of the form start-end"))?;
            let start = parse_hex16(start)?;
            let end = parse_hex16(end)?;
            if start > end {
                return Err(format!("region `{part}` is empty"));
            }
            regions.push((start, end));
        }
        Ok(Regions(regions))
    }
}

fn parse_hex16(s: &str) -> Result<u16, String> {
    u16::from_str_radix(s.trim().trim_start_matches("0x"), 16)
        .map_err(|e| format!("bad hex address `{s}`: {e}"))
}

/// Run a flat Z80 binary image until HALT.
#[derive(Parser, Debug)]
#[command(version, about = "A Z80 emulator for flat binary images")]
struct Cli {
    /// Path to the binary image
    image_path: PathBuf,

    /// Load (and default run) address, hex
    #[arg(long, default_value = "0000", value_parser = parse_hex16)]
    load_addr: u16,

    /// Start execution here instead of at the load address, hex
    #[arg(long, value_parser = parse_hex16)]
    run_addr: Option<u16>,

    /// Print disassembly and registers while PC is inside these
    /// regions (start-end,start-end in hex)
    #[arg(long)]
    trace: Option<Regions>,

    /// Print every data read/write landing in these regions
    #[arg(long)]
    watch: Option<Regions>,

    /// Resume from a snapshot taken from the same image
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Cli::parse();

    let image = std::fs::read(&args.image_path)
        .with_context(|| format!("unable to read image {:?}", args.image_path))?;

    let mut emu = match &args.snapshot {
        Some(snap_path) => {
            let snap = std::fs::read(snap_path)
                .with_context(|| format!("unable to read snapshot {snap_path:?}"))?;
            Emulator::load_snapshot(&image, snap_path, &snap)?
        }
        None => Emulator::for_image(&image, args.load_addr, &args.image_path),
    };

    if let Some(run_addr) = args.run_addr {
        emu.machine.regs.pc = run_addr;
    }
    for &region in args.trace.iter().flat_map(|r| r.0.iter()) {
        emu.machine.add_trace(region);
    }
    for &region in args.watch.iter().flat_map(|r| r.0.iter()) {
        emu.machine.add_watch(region);
    }

    let a = emu.run()?;
    println!("A is 0x{a:02X}");
    Ok(())
}
