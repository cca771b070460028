//! Serialized form of a boot entry's patch settings.
//!
//! Stored either as JSON (byte strings hex-encoded) or as compact bincode
//! (`.rbp`).

use hex_buffer_serde::{Hex as _, HexForm};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use crate::catalog::{BootIdentity, ConnectorOverride, EntryFlags, Gate, PatchCatalog};
use crate::error::{Bincode, Io, Json, Result};
use crate::patch::PatchDirective;

pub const BINARY_EXTENSION: &str = "rbp";

fn is_binary(path: &Path) -> bool {
    path.extension() == Some(OsStr::new(BINARY_EXTENSION))
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug, Default)]
#[serde(default)]
pub struct DirectiveConfig {
    pub label: String,
    #[serde(with = "HexForm::<Vec<u8>>")]
    pub find: Vec<u8>,
    #[serde(with = "HexForm::<Vec<u8>>")]
    pub replace: Vec<u8>,
    pub wildcard: Option<u8>,
    pub count: i32,
    pub match_os: String,
    pub match_build: String,
    pub disabled: bool,
}

impl DirectiveConfig {
    pub fn to_directive(&self) -> Result<PatchDirective> {
        Ok(
            PatchDirective::new(self.label.clone(), self.find.clone(), self.replace.clone())?
                .with_wildcard(self.wildcard)
                .with_count(self.count)
                .with_gate(Gate::new(self.match_os.clone(), self.match_build.clone()))
                .with_enabled(!self.disabled),
        )
    }
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug, Default)]
#[serde(default)]
pub struct DriverPatchConfig {
    /// Driver to patch, matched as a case-insensitive substring.
    pub name: String,
    pub info_plist: bool,
    pub patch: DirectiveConfig,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug, Default)]
#[serde(default)]
pub struct ConnectorConfig {
    pub controller: String,
    #[serde(with = "HexForm::<Vec<u8>>")]
    pub data: Vec<u8>,
    #[serde(with = "HexForm::<Vec<u8>>")]
    pub patch: Vec<u8>,
    pub wildcard: Option<u8>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug, Default)]
#[serde(default)]
pub struct EntryConfig {
    pub os_version: String,
    pub build_version: String,
    pub flags: EntryFlags,
    pub debug: bool,
    pub fake_cpuid: u32,
    pub force_drivers: Vec<String>,
    pub kernel_patches: Vec<DirectiveConfig>,
    pub driver_patches: Vec<DriverPatchConfig>,
    pub booter_patches: Vec<DirectiveConfig>,
    pub connector: Option<ConnectorConfig>,
}

impl EntryConfig {
    /// Loads `.rbp` files as bincode and anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).context(Io { path })?;
        if is_binary(path) {
            bincode::deserialize(&bytes).context(Bincode)
        } else {
            serde_json::from_slice(&bytes).context(Json)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let coded = if is_binary(path) {
            bincode::serialize(self).context(Bincode)?
        } else {
            serde_json::to_vec_pretty(self).context(Json)?
        };
        fs::write(path, coded).context(Io { path })
    }

    pub fn identity(&self) -> BootIdentity {
        BootIdentity::new(self.os_version.clone(), self.build_version.clone())
    }

    /// Builds the catalog, dropping (and recording) malformed directives.
    pub fn catalog(&self) -> PatchCatalog {
        let mut builder = PatchCatalog::builder()
            .flags(self.flags)
            .debug(self.debug)
            .fake_cpuid(self.fake_cpuid);
        for patch in &self.kernel_patches {
            builder = builder.core(patch.to_directive());
        }
        for patch in &self.driver_patches {
            builder = builder.driver(
                patch.name.clone(),
                patch.info_plist,
                patch.patch.to_directive(),
            );
        }
        for patch in &self.booter_patches {
            builder = builder.booter(patch.to_directive());
        }
        if let Some(connector) = &self.connector {
            builder = builder.connector(ConnectorOverride {
                controller: connector.controller.clone(),
                data: connector.data.clone(),
                patch: connector.patch.clone(),
                wildcard: connector.wildcard,
            });
        }
        for name in &self.force_drivers {
            builder = builder.force_driver(name.clone());
        }
        builder.build()
    }
}
