//! Patch and injection engine run just before a boot loader hands control to
//! the operating system: picks the right architecture out of fat images,
//! applies byte-pattern patches to the kernel, boot-stage image and drivers,
//! and injects force-loaded drivers into the boot configuration buffer.

pub mod catalog;
pub mod config;
pub mod error;
pub mod fat;
pub mod inject;
pub mod logger;
pub mod orchestrator;
pub mod patch;

pub use catalog::{BootIdentity, EntryFlags, Gate, PatchCatalog};
pub use config::EntryConfig;
pub use error::{Error, Result};
pub use fat::CpuType;
pub use inject::{ConfigBuffer, DriverImage};
pub use orchestrator::{BootAttempt, BootHandoff, ExitBootNotification, MemorySource};
pub use patch::{PatchDirective, PatchReport};
