//! hotswap-inspect: check whether a function in a binary can be patched.

mod inspect;

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use hotswap::SymbolTable;
use hotswap_intercept::arch::{arm64::Arm64, x86_64::X86_64};
use log::debug;
use object::{Object, ObjectSection};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ArchArg {
    #[value(name = "x86_64")]
    X86_64,
    #[value(name = "aarch64")]
    Aarch64,
}

#[derive(Parser)]
#[command(name = "hotswap-inspect")]
#[command(version, about = "Show how a function would be patched", long_about = None)]
struct Cli {
    /// ELF or Mach-O file to read
    file: PathBuf,

    /// Fully qualified function name
    symbol: String,

    /// Instruction set, when the file header is ambiguous
    #[arg(long, value_enum)]
    arch: Option<ArchArg>,

    /// Bytes to examine when the symbol records no size
    #[arg(long, default_value_t = 64)]
    bytes: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let data = std::fs::read(&cli.file).with_context(|| format!("reading {}", cli.file.display()))?;
    let obj = object::File::parse(&*data).with_context(|| format!("parsing {}", cli.file.display()))?;
    let arch = match cli.arch {
        Some(a) => a,
        None => match obj.architecture() {
            object::Architecture::X86_64 => ArchArg::X86_64,
            object::Architecture::Aarch64 => ArchArg::Aarch64,
            other => bail!("unsupported architecture {other:?}; pass --arch"),
        },
    };

    let table = SymbolTable::parse(&data, 0).context("reading the symbol table")?;
    debug!("{} text symbols in {}", table.len(), cli.file.display());
    let sym = match table.lookup(&cli.symbol) {
        Ok(sym) => sym,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let len = if sym.size > 0 { sym.size } else { cli.bytes };
    let code = section_bytes(&obj, sym.address as u64, len)
        .ok_or_else(|| anyhow!("{} at {:#x} is not inside a section with file data", sym.name, sym.address))?;

    let report = match arch {
        ArchArg::X86_64 => inspect::build::<X86_64>(code, sym.address as u64),
        ArchArg::Aarch64 => inspect::build::<Arm64>(code, sym.address as u64),
    };
    println!("{}", sym.name);
    print!("{report}");
    Ok(())
}

/// Up to `len` bytes of file data at virtual address `addr`.
fn section_bytes<'d>(obj: &object::File<'d>, addr: u64, len: usize) -> Option<&'d [u8]> {
    let section = obj.sections().find(|s| s.address() <= addr && addr < s.address() + s.size())?;
    let data = section.data().ok()?;
    let start = (addr - section.address()) as usize;
    let end = start.checked_add(len)?.min(data.len());
    data.get(start..end)
}
