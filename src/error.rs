use snafu::Snafu;
use std::path::PathBuf;

use crate::orchestrator::Stage;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("no architecture slice matches cpu type {:#x}", cpu_type))]
    SliceNotFound { cpu_type: i32 },

    #[snafu(display(
        "fat header declares {} slices but the image is only {} bytes",
        count,
        len
    ))]
    FatHeaderTruncated { count: u32, len: usize },

    #[snafu(display(
        "slice {:#x} at offset {:#x} (+{:#x}) lies outside a {} byte image",
        cpu_type,
        offset,
        size,
        len
    ))]
    SliceOutOfBounds {
        cpu_type: i32,
        offset: u32,
        size: u32,
        len: usize,
    },

    #[snafu(display(
        "patch {:?}: pattern is {} bytes but replacement is {} bytes",
        label,
        pattern_len,
        replacement_len
    ))]
    MalformedDirective {
        label: String,
        pattern_len: usize,
        replacement_len: usize,
    },

    #[snafu(display(
        "configuration buffer cannot grow by {:#x} bytes ({:#x} available)",
        requested,
        available
    ))]
    ResourceExhausted { requested: usize, available: usize },

    #[snafu(display("{} could not be read", name))]
    ImageUnreadable { name: String },

    #[snafu(display("exit notification already has a boot attempt registered"))]
    AlreadyRegistered,

    #[snafu(display("boot attempt aborted while {}: {}", stage, source))]
    BootAborted { stage: Stage, source: Box<Error> },

    #[snafu(display("unable to access {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("invalid JSON entry configuration: {}", source))]
    Json { source: serde_json::Error },

    #[snafu(display("invalid binary entry configuration: {}", source))]
    Bincode { source: bincode::Error },

    #[snafu(display("unable to install logger: {}", source))]
    Logger { source: log::SetLoggerError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
