use bootpatch::catalog::PatchCatalog;
use bootpatch::fat::{self, CpuType, Selection};
use bootpatch::inject::{DriverRegion, MemoryMapEntry};
use bootpatch::logger;
use bootpatch::orchestrator::{BootAttempt, ExitBootNotification, MemorySource};
use bootpatch::patch::PatchReport;
use bootpatch::{ConfigBuffer, DriverImage, EntryConfig, Error, Result};
use clap::arg_enum;
use log::{info, warn};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use structopt::StructOpt;

/// Where the configuration buffer is assumed to live when run from the
/// command line.
const CONFIG_BASE: u64 = 0x0010_0000;

arg_enum! {
    #[derive(Debug, Clone, Copy)]
    enum Arch {
        X86,
        X64,
        Any
    }
}

impl From<Arch> for CpuType {
    fn from(arch: Arch) -> CpuType {
        match arch {
            Arch::X86 => CpuType::X86,
            Arch::X64 => CpuType::X86_64,
            Arch::Any => CpuType::ANY,
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "bootpatch")]
struct Options {
    /// Log more (-v info, -vv debug, -vvv trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Extract one architecture slice out of a fat image
    Thin {
        #[structopt(
            short,
            long,
            possible_values = &Arch::variants(),
            case_insensitive = true,
            default_value = "X64"
        )]
        arch: Arch,
        #[structopt(index = 1, required = true, name = "FAT", parse(from_os_str))]
        input: PathBuf,
        #[structopt(index = 2, required = true, name = "OUT", parse(from_os_str))]
        output: PathBuf,
    },
    /// Patch a kernel and inject drivers the way a boot entry would
    Patch {
        #[structopt(
            short,
            long,
            possible_values = &Arch::variants(),
            case_insensitive = true,
            default_value = "X64"
        )]
        arch: Arch,
        /// Entry configuration, JSON or .rbp
        #[structopt(index = 1, required = true, name = "ENTRY", parse(from_os_str))]
        entry: PathBuf,
        #[structopt(index = 2, required = true, name = "KERNEL", parse(from_os_str))]
        kernel: PathBuf,
        /// Boot-stage image to patch
        #[structopt(long, parse(from_os_str))]
        booter: Option<PathBuf>,
        /// Directory holding <name>.bin and optional <name>.plist per forced driver
        #[structopt(long, parse(from_os_str))]
        drivers: Option<PathBuf>,
        #[structopt(short, long, parse(from_os_str), default_value = ".")]
        out: PathBuf,
        /// Bytes the configuration buffer may grow to
        #[structopt(long, default_value = "16777216")]
        config_limit: usize,
    },
}

#[derive(Serialize)]
struct Summary<'a> {
    report: &'a PatchReport,
    injected: &'a [DriverRegion],
    abandoned: &'a [String],
    memory_map: &'a [MemoryMapEntry],
    config_len: usize,
    fake_cpuid: Option<u32>,
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Like [`read`], but a missing file is not an error.
fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(Error::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn thin(arch: Arch, input: &Path, output: &Path) -> Result<()> {
    let mut image = read(input)?;
    match fat::thin(&mut image, arch.into())? {
        Selection::Slice(slice) => info!(
            "{} slice at {:#x}, {} bytes",
            slice.cpu_type, slice.offset, slice.size
        ),
        Selection::Whole => warn!("{} is not a fat image, copying as is", input.display()),
    }
    write(output, &image)
}

/// Reads every forced driver now; nothing is read once the attempt runs.
fn load_drivers(source: MemorySource, catalog: &PatchCatalog, dir: &Path) -> MemorySource {
    let mut source = source;
    for name in catalog.forced_drivers() {
        let binary = match read(&dir.join(format!("{}.bin", name))) {
            Ok(binary) => binary,
            Err(error) => {
                warn!("driver {} unavailable: {}", name, error);
                continue;
            }
        };
        let info = match read_optional(&dir.join(format!("{}.plist", name))) {
            Ok(info) => info.unwrap_or_default(),
            Err(error) => {
                warn!("driver {} unavailable: {}", name, error);
                continue;
            }
        };
        source = source.with_driver(name.clone(), DriverImage::from_bundle(name, binary, info));
    }
    source
}

fn patch(
    arch: Arch,
    entry: &Path,
    kernel: &Path,
    booter: Option<&Path>,
    drivers: Option<&Path>,
    out: &Path,
    config_limit: usize,
) -> Result<()> {
    let config = EntryConfig::load(entry)?;
    let catalog = config.catalog();
    for rejected in catalog.rejected() {
        warn!("{}", rejected.error);
    }

    let mut source = MemorySource::new(read(kernel)?);
    if let Some(booter) = booter {
        source = source.with_booter(read(booter)?);
    }
    if let Some(dir) = drivers {
        source = load_drivers(source, &catalog, dir);
    }

    let mut notification = ExitBootNotification::new();
    notification.register(BootAttempt {
        identity: config.identity(),
        catalog,
        cpu: arch.into(),
        source,
        config: ConfigBuffer::new(CONFIG_BASE, Vec::new(), config_limit),
    })?;
    let handoff = match notification.signal() {
        Some(result) => result?,
        None => return Ok(()),
    };

    fs::create_dir_all(out).map_err(|source| Error::Io {
        path: out.to_path_buf(),
        source,
    })?;
    write(&out.join("kernel"), &handoff.kernel)?;
    if let Some(booter) = &handoff.booter {
        write(&out.join("booter"), booter)?;
    }
    for driver in &handoff.drivers {
        write(
            &out.join(format!("{}.bin", driver.identifier)),
            &driver.binary,
        )?;
    }
    write(&out.join("config.bin"), handoff.config.as_bytes())?;

    let summary = Summary {
        report: &handoff.report,
        injected: &handoff.injection.injected,
        abandoned: &handoff.injection.abandoned,
        memory_map: handoff.config.memory_map(),
        config_len: handoff.config.len(),
        fake_cpuid: handoff.fake_cpuid,
    };
    let coded = serde_json::to_vec_pretty(&summary).map_err(|source| Error::Json { source })?;
    write(&out.join("report.json"), &coded)?;
    info!("wrote results to {}", out.display());
    Ok(())
}

fn run(opt: Options) -> Result<()> {
    logger::init(opt.verbose).map_err(|source| Error::Logger { source })?;
    match opt.command {
        Command::Thin {
            arch,
            input,
            output,
        } => thin(arch, &input, &output),
        Command::Patch {
            arch,
            entry,
            kernel,
            booter,
            drivers,
            out,
            config_limit,
        } => patch(
            arch,
            &entry,
            &kernel,
            booter.as_deref(),
            drivers.as_deref(),
            &out,
            config_limit,
        ),
    }
}

fn main() {
    let opt = Options::from_args();
    if let Err(error) = run(opt) {
        eprintln!("error: {}", error);
        std::process::exit(1);
    }
}
