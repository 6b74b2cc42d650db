//! Compile a textual IR file and print it at a chosen pipeline stage.

use bumpalo::Bump;
use clap::{Parser, ValueEnum};
use irjit::codegen::{allocate, assemble, lower};
use irjit::core::Stats;
use irjit::{dump, object_file, text_ir};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Stage {
    /// As parsed.
    Builder,
    /// After lowering to two-address form.
    Lowered,
    /// After register allocation.
    Allocated,
    /// With byte offsets after emission.
    Emitted,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The input file. Reads stdin if not given.
    input: Option<PathBuf>,

    /// Pipeline stage to print.
    #[arg(short, long, value_enum, default_value = "emitted")]
    stage: Stage,

    /// Also print the machine code as hex.
    #[arg(long, action)]
    hex: bool,

    /// Write the machine code to an ELF object file.
    #[arg(long)]
    elf: Option<PathBuf>,

    /// Symbol name used in the ELF object.
    #[arg(long, default_value = "irjit_unit")]
    symbol: String,

    /// Print code generation statistics.
    #[arg(long, action)]
    stats: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let text = match &cli.input {
        Some(path) => fs::read_to_string(path)?,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    let seq = text_ir::parse(&text)?;

    match cli.stage {
        Stage::Builder => print!("{}", dump::dump_seq(&seq)),
        Stage::Lowered => print!("{}", dump::dump_lowered(&lower(seq.clone())?)),
        Stage::Allocated => {
            let bump = Bump::new();
            print!("{}", dump::dump_allocated(&allocate(lower(seq.clone())?, &bump)?));
        }
        Stage::Emitted => {}
    }

    let stats = Stats::new(cli.stats);
    let asm = assemble(seq, &stats)?;
    if matches!(cli.stage, Stage::Emitted) {
        print!("{}", dump::dump_assembled(&asm));
    }
    if cli.hex {
        print!("{}", dump::hex(&asm.code));
    }
    if let Some(path) = &cli.elf {
        fs::write(path, object_file::write_elf(&cli.symbol, &asm.code)?)?;
        eprintln!("wrote {} bytes of code to {}", asm.code.len(), path.display());
    }
    if cli.stats {
        print!("{}", stats.snapshot());
    }
    Ok(())
}
