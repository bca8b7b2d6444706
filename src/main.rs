// rv2a64 - RISC-V to AArch64 static binary translator
//
// Usage:
//   rv2a64 [--cfg] [--ir] [--aarch64 out.s] input.elf

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use rv2a64::{cfg, elf, emit, isel, lifter, liveness, regalloc};

#[derive(Parser, Debug)]
#[command(name = "rv2a64")]
#[command(about = "RISC-V to AArch64 static binary translator")]
#[command(version)]
struct Args {
    /// Dump the discovered CFG in address order
    #[arg(long = "cfg")]
    dump_cfg: bool,

    /// Dump per-block lifted IR
    #[arg(long = "ir")]
    dump_ir: bool,

    /// Write the AArch64 assembly unit to this path
    #[arg(long = "aarch64", value_name = "PATH")]
    aarch64: Option<PathBuf>,

    /// Input RISC-V ELF binary
    input: PathBuf,
}

fn run(args: &Args) -> Result<()> {
    let data = std::fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let image = elf::parse(&data)?;
    let graph = cfg::build(&image, image.entry);
    let addrs = graph.addrs_in_order();

    if args.dump_cfg || args.dump_ir {
        for &addr in &addrs {
            let bb = graph.block_at(addr).expect("leader has a block");
            if args.dump_cfg {
                print!("{}", cfg::format_block(bb));
            }
            if args.dump_ir {
                print!("{}", lifter::lift(bb));
            }
        }
    }

    if let Some(out_path) = &args.aarch64 {
        let dump_liveness = std::env::var_os("RV2A64_DUMP_LIVENESS").is_some();

        let mut blocks = Vec::with_capacity(addrs.len());
        let mut assignments = Vec::with_capacity(addrs.len());
        for &addr in &addrs {
            let bb = graph.block_at(addr).expect("leader has a block");
            let irbb = lifter::lift(bb);
            let mb = isel::select(&irbb);
            let live = liveness::analyze(&mb);
            if dump_liveness {
                println!(
                    "-- liveness for block 0x{:x} ({} instrs)",
                    addr,
                    mb.instrs.len()
                );
                let mut vregs: Vec<_> = live.iter().collect();
                vregs.sort_by_key(|(v, _)| **v);
                for (v, lr) in vregs {
                    println!("  v{}: [{}, {}]", v, lr.start, lr.end);
                }
            }
            let asg = regalloc::allocate(&mb, &live);
            blocks.push(mb);
            assignments.push(asg);
        }

        let text = emit::emit(&blocks, &assignments, image.entry);
        std::fs::write(out_path, text)
            .with_context(|| format!("failed to write {}", out_path.display()))?;
        println!("wrote AArch64 assembly to {}", out_path.display());
    }

    Ok(())
}

fn main() {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) if err.use_stderr() => {
            eprintln!("{err}");
            std::process::exit(1);
        }
        // --help / --version
        Err(err) => err.exit(),
    };

    if let Err(err) = run(&args) {
        eprintln!("rv2a64: {err:#}");
        std::process::exit(1);
    }
}
