//! Per-boot-entry patch catalog and the gating rules deciding which
//! directives apply to a boot attempt.

use bitflags::bitflags;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::patch::PatchDirective;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EntryFlags: u16 {
        /// Inject the forced drivers.
        const WITH_DRIVERS = 1 << 1;
        /// Log every directive at debug level, matches or not.
        const DEBUG_PATCHES = 1 << 10;
        const ALLOW_DRIVER_PATCHES = 1 << 11;
        const ALLOW_CORE_PATCHES = 1 << 12;
        const ALLOW_BOOTER_PATCHES = 1 << 13;
    }
}

impl Default for EntryFlags {
    fn default() -> Self {
        EntryFlags::WITH_DRIVERS
            | EntryFlags::ALLOW_DRIVER_PATCHES
            | EntryFlags::ALLOW_CORE_PATCHES
            | EntryFlags::ALLOW_BOOTER_PATCHES
    }
}

/// OS and build identity of the system being booted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BootIdentity {
    pub os: String,
    pub build: String,
}

impl BootIdentity {
    pub fn new(os: impl Into<String>, build: impl Into<String>) -> Self {
        BootIdentity {
            os: os.into(),
            build: build.into(),
        }
    }
}

/// Restricts a directive to one OS and/or build identity. An empty field
/// matches anything; otherwise the comparison is exact and ASCII
/// case-insensitive, with no prefix or glob semantics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Gate {
    pub os: String,
    pub build: String,
}

impl Gate {
    pub fn new(os: impl Into<String>, build: impl Into<String>) -> Self {
        Gate {
            os: os.into(),
            build: build.into(),
        }
    }

    pub fn os(os: impl Into<String>) -> Self {
        Gate::new(os, "")
    }

    pub fn admits(&self, identity: &BootIdentity) -> bool {
        field_matches(&self.os, &identity.os) && field_matches(&self.build, &identity.build)
    }
}

fn field_matches(gate: &str, value: &str) -> bool {
    gate.is_empty() || gate.eq_ignore_ascii_case(value)
}

/// Case-insensitive substring search, used to pair driver patches with the
/// driver they name.
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverPatch {
    /// Driver the patch applies to, matched as a substring of the driver
    /// identifier.
    pub target: String,
    /// Patch the driver's Info.plist text instead of its binary.
    pub info_plist: bool,
    pub directive: PatchDirective,
}

impl DriverPatch {
    pub fn targets(&self, identifier: &str) -> bool {
        !self.target.is_empty() && contains_ignore_case(identifier, &self.target)
    }
}

/// Display adapter connector table override. Becomes a single driver patch
/// against the matching controller driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectorOverride {
    pub controller: String,
    pub data: Vec<u8>,
    pub patch: Vec<u8>,
    pub wildcard: Option<u8>,
}

impl ConnectorOverride {
    pub const LABEL: &'static str = "ATIConnectorsController";

    pub fn driver_name(&self) -> String {
        format!("ATI{}Controller", self.controller)
    }

    fn into_patch(self) -> Result<DriverPatch> {
        let target = self.driver_name();
        let directive =
            PatchDirective::new(Self::LABEL, self.data, self.patch)?.with_wildcard(self.wildcard);
        Ok(DriverPatch {
            target,
            info_plist: false,
            directive,
        })
    }
}

/// A directive dropped while building the catalog.
#[derive(Debug)]
pub struct Rejected {
    pub label: String,
    pub error: Error,
}

/// Everything a boot entry asks the engine to do. Immutable once built.
#[derive(Debug, Default)]
pub struct PatchCatalog {
    flags: EntryFlags,
    debug: bool,
    fake_cpuid: u32,
    core: Vec<PatchDirective>,
    booter: Vec<PatchDirective>,
    drivers: Vec<DriverPatch>,
    connector: Option<DriverPatch>,
    forced_drivers: Vec<String>,
    rejected: Vec<Rejected>,
}

impl PatchCatalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    pub fn debug(&self) -> bool {
        self.debug || self.flags.contains(EntryFlags::DEBUG_PATCHES)
    }

    /// CPUID value to report to the kernel instead of the real one.
    pub fn fake_cpuid(&self) -> Option<u32> {
        if self.fake_cpuid != 0 {
            Some(self.fake_cpuid)
        } else {
            None
        }
    }

    pub fn core_patches(&self) -> &[PatchDirective] {
        &self.core
    }

    pub fn booter_patches(&self) -> &[PatchDirective] {
        &self.booter
    }

    pub fn driver_patches(&self) -> &[DriverPatch] {
        &self.drivers
    }

    pub fn connector_patch(&self) -> Option<&DriverPatch> {
        self.connector.as_ref()
    }

    pub fn forced_drivers(&self) -> &[String] {
        &self.forced_drivers
    }

    pub fn rejected(&self) -> &[Rejected] {
        &self.rejected
    }

    pub fn injects_drivers(&self) -> bool {
        self.flags.contains(EntryFlags::WITH_DRIVERS)
    }

    /// Core-image directives to run, in catalog order.
    pub fn eligible_core<'a>(
        &'a self,
        identity: &'a BootIdentity,
    ) -> impl Iterator<Item = &'a PatchDirective> + 'a {
        let allowed = self.flags.contains(EntryFlags::ALLOW_CORE_PATCHES);
        self.core
            .iter()
            .filter(move |directive| allowed && directive.is_eligible(identity))
    }

    pub fn eligible_booter<'a>(
        &'a self,
        identity: &'a BootIdentity,
    ) -> impl Iterator<Item = &'a PatchDirective> + 'a {
        let allowed = self.flags.contains(EntryFlags::ALLOW_BOOTER_PATCHES);
        self.booter
            .iter()
            .filter(move |directive| allowed && directive.is_eligible(identity))
    }

    /// Driver directives aimed at `identifier`, in catalog order, followed by
    /// the connector override when it targets this driver.
    pub fn eligible_for_driver<'a>(
        &'a self,
        identity: &'a BootIdentity,
        identifier: &'a str,
    ) -> impl Iterator<Item = &'a DriverPatch> + 'a {
        let allowed = self.flags.contains(EntryFlags::ALLOW_DRIVER_PATCHES);
        self.drivers
            .iter()
            .chain(self.connector.iter())
            .filter(move |patch| {
                allowed && patch.targets(identifier) && patch.directive.is_eligible(identity)
            })
    }

    /// Number of directives that will not run for `identity`, given whether a
    /// boot-stage image is present and which drivers were loaded.
    ///
    /// A driver directive or the connector override counts as skipped unless
    /// at least one loaded driver runs it.
    pub fn skipped_count(
        &self,
        identity: &BootIdentity,
        has_booter: bool,
        drivers: &[&str],
    ) -> usize {
        let core = self.core.len() - self.eligible_core(identity).count();
        let booter = if has_booter {
            self.booter.len() - self.eligible_booter(identity).count()
        } else {
            self.booter.len()
        };
        let allowed = self.flags.contains(EntryFlags::ALLOW_DRIVER_PATCHES);
        let unused = self
            .drivers
            .iter()
            .chain(self.connector.iter())
            .filter(|patch| {
                !(allowed
                    && patch.directive.is_eligible(identity)
                    && drivers.iter().any(|driver| patch.targets(driver)))
            })
            .count();
        core + booter + unused
    }
}

/// Collects directives for a [`PatchCatalog`], dropping malformed ones.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    catalog: PatchCatalog,
}

impl CatalogBuilder {
    pub fn flags(mut self, flags: EntryFlags) -> Self {
        self.catalog.flags = flags;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.catalog.debug = debug;
        self
    }

    pub fn fake_cpuid(mut self, cpuid: u32) -> Self {
        self.catalog.fake_cpuid = cpuid;
        self
    }

    pub fn core(mut self, directive: Result<PatchDirective>) -> Self {
        if let Some(directive) = self.accept(directive) {
            self.catalog.core.push(directive);
        }
        self
    }

    pub fn booter(mut self, directive: Result<PatchDirective>) -> Self {
        // boot-stage patches are gated on the OS only
        if let Some(directive) = self.accept(directive) {
            let gate = Gate::os(directive.gate().os.clone());
            self.catalog.booter.push(directive.with_gate(gate));
        }
        self
    }

    pub fn driver(
        mut self,
        target: impl Into<String>,
        info_plist: bool,
        directive: Result<PatchDirective>,
    ) -> Self {
        if let Some(directive) = self.accept(directive) {
            self.catalog.drivers.push(DriverPatch {
                target: target.into(),
                info_plist,
                directive,
            });
        }
        self
    }

    pub fn connector(mut self, connector: ConnectorOverride) -> Self {
        if let Some(patch) = self.accept(connector.into_patch()) {
            self.catalog.connector = Some(patch);
        }
        self
    }

    pub fn force_driver(mut self, name: impl Into<String>) -> Self {
        self.catalog.forced_drivers.push(name.into());
        self
    }

    pub fn build(self) -> PatchCatalog {
        self.catalog
    }

    fn accept<T>(&mut self, item: Result<T>) -> Option<T> {
        match item {
            Ok(item) => Some(item),
            Err(error) => {
                let label = match &error {
                    Error::MalformedDirective { label, .. } => label.clone(),
                    _ => String::new(),
                };
                warn!("dropping patch {:?}: {}", label, error);
                self.catalog.rejected.push(Rejected { label, error });
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive(label: &str) -> Result<PatchDirective> {
        PatchDirective::new(label, vec![0x01], vec![0x02])
    }

    fn gated(label: &str, os: &str, build: &str) -> Result<PatchDirective> {
        directive(label).map(|d| d.with_gate(Gate::new(os, build)))
    }

    #[test]
    fn os_gate_is_exact_and_case_insensitive() {
        let gate = Gate::os("10.12");
        assert!(gate.admits(&BootIdentity::new("10.12", "")));
        assert!(!gate.admits(&BootIdentity::new("10.13", "")));
        assert!(!gate.admits(&BootIdentity::new("10.12.6", "")));

        let build = Gate::new("", "16a323");
        assert!(build.admits(&BootIdentity::new("10.12", "16A323")));
        assert!(!build.admits(&BootIdentity::new("10.12", "16A32")));
    }

    #[test]
    fn empty_gate_admits_everything() {
        let identity = BootIdentity::new("anything", "at all");
        assert!(Gate::default().admits(&identity));
        assert!(Gate::default().admits(&BootIdentity::default()));
    }

    #[test]
    fn malformed_directive_is_dropped_at_build_time() {
        let catalog = PatchCatalog::builder()
            .core(directive("good"))
            .core(PatchDirective::new("bad", vec![1, 2], vec![1]))
            .core(directive("also good"))
            .build();

        let labels: Vec<_> = catalog.core_patches().iter().map(|d| d.label()).collect();
        assert_eq!(labels, vec!["good", "also good"]);
        assert_eq!(catalog.rejected().len(), 1);
        assert_eq!(catalog.rejected()[0].label, "bad");
    }

    #[test]
    fn eligible_core_preserves_order_and_skips_gated() {
        let identity = BootIdentity::new("10.13", "17A365");
        let catalog = PatchCatalog::builder()
            .core(gated("a", "", ""))
            .core(gated("b", "10.12", ""))
            .core(directive("c").map(|d| d.with_enabled(false)))
            .core(gated("d", "10.13", "17a365"))
            .build();

        let labels: Vec<_> = catalog
            .eligible_core(&identity)
            .map(|d| d.label())
            .collect();
        assert_eq!(labels, vec!["a", "d"]);
        assert_eq!(catalog.skipped_count(&identity, false, &[]), 2);
    }

    #[test]
    fn unused_driver_directives_count_as_skipped() {
        let identity = BootIdentity::default();
        let catalog = PatchCatalog::builder()
            .booter(directive("boot"))
            .driver("AppleHDA", false, directive("hda"))
            .driver("Missing", false, directive("missing"))
            .connector(ConnectorOverride {
                controller: "Shrike".to_string(),
                data: vec![1],
                patch: vec![2],
                wildcard: None,
            })
            .build();

        // no boot-stage image, no Missing driver, no connector driver
        let loaded = ["com.apple.driver.AppleHDA"];
        assert_eq!(catalog.skipped_count(&identity, false, &loaded), 3);
        assert_eq!(catalog.skipped_count(&identity, true, &loaded), 2);
        let loaded = ["com.apple.driver.AppleHDA", "ATIShrikeController", "Missing"];
        assert_eq!(catalog.skipped_count(&identity, true, &loaded), 0);
    }

    #[test]
    fn allow_flags_disable_whole_kinds() {
        let identity = BootIdentity::default();
        let catalog = PatchCatalog::builder()
            .flags(EntryFlags::default() - EntryFlags::ALLOW_CORE_PATCHES)
            .core(directive("core"))
            .booter(directive("booter"))
            .build();

        assert_eq!(catalog.eligible_core(&identity).count(), 0);
        assert_eq!(catalog.eligible_booter(&identity).count(), 1);
    }

    #[test]
    fn booter_patches_ignore_build_gate() {
        let catalog = PatchCatalog::builder()
            .booter(gated("boot", "10.13", "17A365"))
            .build();
        let identity = BootIdentity::new("10.13", "other build");
        assert_eq!(catalog.eligible_booter(&identity).count(), 1);
    }

    #[test]
    fn driver_patches_match_target_substring() {
        let identity = BootIdentity::default();
        let catalog = PatchCatalog::builder()
            .driver("AppleHDA", false, directive("hda"))
            .driver("IOAHCI", true, directive("ahci"))
            .build();

        let hits: Vec<_> = catalog
            .eligible_for_driver(&identity, "com.apple.driver.applehda")
            .map(|p| p.directive.label())
            .collect();
        assert_eq!(hits, vec!["hda"]);
        assert_eq!(
            catalog
                .eligible_for_driver(&identity, "com.apple.iokit.IOAHCIFamily")
                .count(),
            1
        );
        assert_eq!(catalog.eligible_for_driver(&identity, "Other").count(), 0);
    }

    #[test]
    fn connector_override_targets_controller_driver_last() {
        let identity = BootIdentity::default();
        let catalog = PatchCatalog::builder()
            .driver("ATI", false, directive("generic"))
            .connector(ConnectorOverride {
                controller: "5000".to_string(),
                data: vec![1, 2],
                patch: vec![3, 4],
                wildcard: None,
            })
            .build();

        let hits: Vec<_> = catalog
            .eligible_for_driver(&identity, "com.apple.kext.ATI5000Controller")
            .map(|p| p.directive.label())
            .collect();
        assert_eq!(hits, vec!["generic", ConnectorOverride::LABEL]);
        assert_eq!(
            catalog
                .eligible_for_driver(&identity, "com.apple.kext.ATI6000Controller")
                .count(),
            1
        );
    }

    #[test]
    fn substring_search_ignores_case() {
        let identifier = "com.apple.driver.AppleHDA";
        assert!(contains_ignore_case(identifier, "applehda"));
        assert!(contains_ignore_case("abc", ""));
        assert!(!contains_ignore_case("ab", "abc"));
        assert!(!contains_ignore_case("FakeSMC", "smcx"));
    }

    #[test]
    fn fake_cpuid_zero_means_unset() {
        assert_eq!(PatchCatalog::builder().build().fake_cpuid(), None);
        assert_eq!(
            PatchCatalog::builder().fake_cpuid(0x0306A9).build().fake_cpuid(),
            Some(0x0306A9)
        );
    }
}
