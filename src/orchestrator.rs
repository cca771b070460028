//! Runs the whole engine for one boot attempt.
//!
//! The work is deferred to the exit-boot-services notification: by then the
//! physical memory layout is final. Images are therefore read up front, while
//! file services still exist, and handed over inside the [`BootAttempt`].

use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::fmt;

use crate::catalog::{BootIdentity, DriverPatch, PatchCatalog};
use crate::error::{Error, Result};
use crate::fat::{self, CpuType, ImageKind, Selection};
use crate::inject::{self, ConfigBuffer, DriverImage, InjectionOutcome, INJECTOR_IDENTITY};
use crate::patch::{PatchDirective, PatchReport, PatchTarget};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Idle,
    SliceSelected,
    ImagePatched,
    DriversInjected,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "selecting slices",
            Stage::SliceSelected => "patching images",
            Stage::ImagePatched => "injecting drivers",
            Stage::DriversInjected => "handing off",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Supplies raw image bytes. Implementations must not need firmware file
/// services once the attempt is triggered.
pub trait ImageSource {
    fn core_image(&mut self) -> Result<Vec<u8>>;

    /// The boot-stage image, when the entry has one to patch.
    fn booter_image(&mut self) -> Option<Vec<u8>>;

    fn driver(&mut self, name: &str) -> Result<DriverImage>;
}

/// Images preloaded into memory.
#[derive(Debug, Default)]
pub struct MemorySource {
    core: Option<Vec<u8>>,
    booter: Option<Vec<u8>>,
    drivers: HashMap<String, DriverImage>,
}

impl MemorySource {
    pub fn new(core: Vec<u8>) -> Self {
        MemorySource {
            core: Some(core),
            ..Default::default()
        }
    }

    pub fn with_booter(mut self, booter: Vec<u8>) -> Self {
        self.booter = Some(booter);
        self
    }

    /// Registers a driver under the name the catalog forces it by.
    pub fn with_driver(mut self, name: impl Into<String>, driver: DriverImage) -> Self {
        self.drivers.insert(name.into(), driver);
        self
    }
}

impl ImageSource for MemorySource {
    fn core_image(&mut self) -> Result<Vec<u8>> {
        self.core.take().ok_or_else(|| Error::ImageUnreadable {
            name: "core image".to_string(),
        })
    }

    fn booter_image(&mut self) -> Option<Vec<u8>> {
        self.booter.take()
    }

    fn driver(&mut self, name: &str) -> Result<DriverImage> {
        self.drivers
            .remove(name)
            .ok_or_else(|| Error::ImageUnreadable {
                name: name.to_string(),
            })
    }
}

/// Everything one boot attempt owns.
pub struct BootAttempt<S> {
    pub identity: BootIdentity,
    pub catalog: PatchCatalog,
    pub cpu: CpuType,
    pub source: S,
    pub config: ConfigBuffer,
}

/// Result handed to the transfer-of-control step.
#[derive(Debug)]
pub struct BootHandoff {
    pub kernel: Vec<u8>,
    pub booter: Option<Vec<u8>>,
    pub drivers: Vec<DriverImage>,
    pub config: ConfigBuffer,
    pub injection: InjectionOutcome,
    pub report: PatchReport,
    pub fake_cpuid: Option<u32>,
}

pub struct PatchOrchestrator<S> {
    attempt: BootAttempt<S>,
    stage: Stage,
    report: PatchReport,
}

impl<S: ImageSource> PatchOrchestrator<S> {
    pub fn new(attempt: BootAttempt<S>) -> Self {
        PatchOrchestrator {
            attempt,
            stage: Stage::Idle,
            report: PatchReport::default(),
        }
    }

    fn advance(&mut self, next: Stage) {
        debug!("{:?} -> {:?}", self.stage, next);
        self.stage = next;
    }

    fn fail(&mut self, error: Error) -> Error {
        let stage = self.stage;
        error!("boot attempt aborted while {}: {}", stage, error);
        self.stage = Stage::Failed;
        Error::BootAborted {
            stage,
            source: Box::new(error),
        }
    }

    fn trace_directive(&self, message: fmt::Arguments<'_>) {
        if self.attempt.catalog.debug() {
            debug!("{}", message);
        } else {
            trace!("{}", message);
        }
    }

    /// Runs the attempt to completion. Any error means the core image could
    /// not be prepared and the caller should fall back to an unmodified boot.
    pub fn run(mut self) -> Result<BootHandoff> {
        info!(
            "patching for os {:?} build {:?} ({})",
            self.attempt.identity.os, self.attempt.identity.build, self.attempt.cpu
        );

        let mut kernel = match self.load_core() {
            Ok(kernel) => kernel,
            Err(error) => return Err(self.fail(error)),
        };
        let mut booter = self.load_booter();
        let mut drivers = self.load_drivers();
        self.advance(Stage::SliceSelected);

        self.patch_core(&mut kernel);
        if let Some(booter) = booter.as_mut() {
            self.patch_booter(booter);
        }
        for driver in drivers.iter_mut() {
            self.patch_driver(driver);
        }
        let loaded: Vec<&str> = drivers.iter().map(|d| d.identifier.as_str()).collect();
        self.report.skipped = self.attempt.catalog.skipped_count(
            &self.attempt.identity,
            booter.is_some(),
            &loaded,
        );
        self.advance(Stage::ImagePatched);

        let injection = inject::inject(&mut self.attempt.config, &drivers, INJECTOR_IDENTITY);
        if injection.is_partial() {
            warn!(
                "driver injection incomplete: {} injected, {} abandoned",
                injection.injected.len(),
                injection.abandoned.len()
            );
        }
        self.advance(Stage::DriversInjected);

        let fake_cpuid = self.attempt.catalog.fake_cpuid();
        if let Some(cpuid) = fake_cpuid {
            info!("reporting fake cpuid {:#x}", cpuid);
        }
        info!(
            "{} replacement(s), {} driver(s) injected, config now {:#x} bytes",
            self.report.total(),
            injection.injected.len(),
            self.attempt.config.len()
        );
        self.advance(Stage::Done);

        Ok(BootHandoff {
            kernel,
            booter,
            drivers,
            config: self.attempt.config,
            injection,
            report: self.report,
            fake_cpuid,
        })
    }

    fn load_core(&mut self) -> Result<Vec<u8>> {
        let mut kernel = self.attempt.source.core_image()?;
        let kind = ImageKind::detect(&kernel);
        let selection = fat::thin(&mut kernel, self.attempt.cpu)?;
        match selection {
            Selection::Slice(slice) => debug!(
                "core image: {} slice at {:#x} (+{:#x})",
                slice.cpu_type, slice.offset, slice.size
            ),
            Selection::Whole => debug!("core image: {:?}, used whole", kind),
        }
        Ok(kernel)
    }

    fn load_booter(&mut self) -> Option<Vec<u8>> {
        let mut booter = self.attempt.source.booter_image()?;
        match fat::thin(&mut booter, self.attempt.cpu) {
            Ok(_) => Some(booter),
            Err(error) => {
                warn!("boot-stage image skipped: {}", error);
                None
            }
        }
    }

    fn load_drivers(&mut self) -> Vec<DriverImage> {
        if !self.attempt.catalog.injects_drivers() {
            debug!("driver injection disabled for this entry");
            return Vec::new();
        }

        let mut drivers = Vec::new();
        for name in self.attempt.catalog.forced_drivers() {
            let mut driver = match self.attempt.source.driver(name) {
                Ok(driver) => driver,
                Err(error) => {
                    warn!("driver {} skipped: {}", name, error);
                    continue;
                }
            };
            if let Err(error) = fat::thin(&mut driver.binary, self.attempt.cpu) {
                warn!("driver {} skipped: {}", name, error);
                continue;
            }
            drivers.push(driver);
        }
        drivers
    }

    fn run_directive(&mut self, directive: &PatchDirective, target: PatchTarget, buf: &mut [u8]) {
        let replaced = directive.apply(buf);
        self.trace_directive(format_args!(
            "{:?} on {:?}: {} replacement(s)",
            directive.label(),
            target,
            replaced
        ));
        self.report.record(directive, target, replaced);
    }

    fn patch_core(&mut self, kernel: &mut [u8]) {
        let directives: Vec<PatchDirective> = self
            .attempt
            .catalog
            .eligible_core(&self.attempt.identity)
            .cloned()
            .collect();
        for directive in &directives {
            self.run_directive(directive, PatchTarget::Core, kernel);
        }
    }

    fn patch_booter(&mut self, booter: &mut [u8]) {
        let directives: Vec<PatchDirective> = self
            .attempt
            .catalog
            .eligible_booter(&self.attempt.identity)
            .cloned()
            .collect();
        for directive in &directives {
            self.run_directive(directive, PatchTarget::Booter, booter);
        }
    }

    fn patch_driver(&mut self, driver: &mut DriverImage) {
        let patches: Vec<DriverPatch> = self
            .attempt
            .catalog
            .eligible_for_driver(&self.attempt.identity, &driver.identifier)
            .cloned()
            .collect();
        for patch in &patches {
            let target = PatchTarget::Driver {
                name: driver.identifier.clone(),
                info_plist: patch.info_plist,
            };
            let buf = if patch.info_plist {
                &mut driver.info
            } else {
                &mut driver.binary
            };
            self.run_directive(&patch.directive, target, buf);
        }
    }
}

/// The one-shot exit-boot-services hook.
///
/// At most one attempt can be registered, and signalling consumes it, so the
/// engine runs at most once per registration.
pub struct ExitBootNotification<S> {
    pending: Option<PatchOrchestrator<S>>,
}

impl<S> Default for ExitBootNotification<S> {
    fn default() -> Self {
        ExitBootNotification { pending: None }
    }
}

impl<S: ImageSource> ExitBootNotification<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, attempt: BootAttempt<S>) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::AlreadyRegistered);
        }
        self.pending = Some(PatchOrchestrator::new(attempt));
        Ok(())
    }

    pub fn is_armed(&self) -> bool {
        self.pending.is_some()
    }

    /// Fires the notification. Returns `None` when nothing is registered.
    pub fn signal(&mut self) -> Option<Result<BootHandoff>> {
        self.pending.take().map(PatchOrchestrator::run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Gate;
    use crate::fat::tests::fat_image;
    use crate::inject::PAGE_SIZE;
    use proptest::prelude::*;

    fn attempt(source: MemorySource, catalog: PatchCatalog) -> BootAttempt<MemorySource> {
        BootAttempt {
            identity: BootIdentity::new("10.13", "17A365"),
            catalog,
            cpu: CpuType::X86_64,
            source,
            config: ConfigBuffer::new(0x4000_0000, Vec::new(), 64 * PAGE_SIZE),
        }
    }

    fn replace(label: &str, from: u8, to: u8) -> Result<PatchDirective> {
        PatchDirective::new(label, vec![from], vec![to])
    }

    #[test]
    fn missing_core_slice_is_fatal() {
        let kernel = fat_image(&[(CpuType(12), 4)]);
        let catalog = PatchCatalog::builder().build();
        let orchestrator = PatchOrchestrator::new(attempt(MemorySource::new(kernel), catalog));

        match orchestrator.run() {
            Err(Error::BootAborted { stage, source }) => {
                assert_eq!(stage, Stage::Idle);
                assert!(matches!(*source, Error::SliceNotFound { .. }));
            }
            other => panic!("unexpected {:?}", other.map(|h| h.report)),
        }
    }

    #[test]
    fn unreadable_core_is_fatal() {
        let source = MemorySource::default();
        let result = PatchOrchestrator::new(attempt(source, PatchCatalog::builder().build())).run();
        assert!(matches!(result, Err(Error::BootAborted { .. })));
    }

    #[test]
    fn core_patches_run_before_driver_patches_in_catalog_order() {
        let kernel = fat_image(&[(CpuType::X86, 2), (CpuType::X86_64, 4)]);
        let catalog = PatchCatalog::builder()
            .core(replace("first", 2, 5))
            .core(replace("second", 5, 6))
            .driver("Lilu", false, replace("driver", 0xAA, 0xBB))
            .force_driver("Lilu")
            .build();
        let source = MemorySource::new(kernel)
            .with_driver("Lilu", DriverImage::new("Lilu", vec![0xAA, 0x00]));

        let handoff = PatchOrchestrator::new(attempt(source, catalog)).run().unwrap();
        assert_eq!(handoff.kernel, vec![6; 4]);
        assert_eq!(handoff.drivers[0].binary, vec![0xBB, 0x00]);

        let labels: Vec<_> = handoff
            .report
            .records
            .iter()
            .map(|r| r.label.as_str())
            .collect();
        assert_eq!(labels, vec!["first", "second", "driver"]);
        assert_eq!(handoff.injection.injected.len(), 1);
    }

    #[test]
    fn missing_driver_is_skipped() {
        let catalog = PatchCatalog::builder()
            .force_driver("Missing")
            .force_driver("Present")
            .build();
        let source = MemorySource::new(vec![0; 8])
            .with_driver("Present", DriverImage::new("Present", vec![1]));

        let handoff = PatchOrchestrator::new(attempt(source, catalog)).run().unwrap();
        let ids: Vec<_> = handoff
            .drivers
            .iter()
            .map(|d| d.identifier.as_str())
            .collect();
        assert_eq!(ids, vec!["Present"]);
    }

    #[test]
    fn patches_for_absent_drivers_are_counted_as_skipped() {
        let catalog = PatchCatalog::builder()
            .driver("Missing", false, replace("gone", 1, 2))
            .driver("Present", false, replace("here", 1, 2))
            .force_driver("Missing")
            .force_driver("Present")
            .build();
        let source = MemorySource::new(vec![0; 8])
            .with_driver("Present", DriverImage::new("Present", vec![1]));

        let handoff = PatchOrchestrator::new(attempt(source, catalog)).run().unwrap();
        assert_eq!(handoff.report.replacements_for("here"), 1);
        assert_eq!(handoff.report.skipped, 1);
    }

    #[test]
    fn driver_without_matching_slice_is_skipped() {
        let catalog = PatchCatalog::builder().force_driver("Arm").build();
        let driver = DriverImage::new("Arm", fat_image(&[(CpuType(12), 4)]));
        let source = MemorySource::new(vec![0; 8]).with_driver("Arm", driver);

        let handoff = PatchOrchestrator::new(attempt(source, catalog)).run().unwrap();
        assert!(handoff.drivers.is_empty());
        assert!(handoff.config.is_empty());
    }

    #[test]
    fn gated_directives_leave_image_untouched() {
        let catalog = PatchCatalog::builder()
            .core(replace("old", 1, 2).map(|d| d.with_gate(Gate::os("10.12"))))
            .core(replace("off", 1, 3).map(|d| d.with_enabled(false)))
            .build();
        let handoff = PatchOrchestrator::new(attempt(MemorySource::new(vec![1; 4]), catalog))
            .run()
            .unwrap();
        assert_eq!(handoff.kernel, vec![1; 4]);
        assert!(handoff.report.records.is_empty());
        assert_eq!(handoff.report.skipped, 2);
    }

    #[test]
    fn info_plist_patches_touch_only_the_plist() {
        let catalog = PatchCatalog::builder()
            .driver(
                "HDA",
                true,
                PatchDirective::new("plist", b"Old".to_vec(), b"New".to_vec()),
            )
            .force_driver("HDA")
            .build();
        let driver = DriverImage::new("AppleHDA", b"Old".to_vec())
            .with_info(b"<string>Old</string>".to_vec());
        let source = MemorySource::new(vec![0; 4]).with_driver("HDA", driver);

        let handoff = PatchOrchestrator::new(attempt(source, catalog)).run().unwrap();
        assert_eq!(handoff.drivers[0].info, b"<string>New</string>".to_vec());
        assert_eq!(handoff.drivers[0].binary, b"Old".to_vec());
    }

    #[test]
    fn booter_is_patched_when_present() {
        let catalog = PatchCatalog::builder().booter(replace("boot", 7, 8)).build();
        let source = MemorySource::new(vec![0; 4]).with_booter(vec![7, 7]);

        let handoff = PatchOrchestrator::new(attempt(source, catalog)).run().unwrap();
        assert_eq!(handoff.booter, Some(vec![8, 8]));
        assert_eq!(handoff.report.replacements_for("boot"), 2);
    }

    #[test]
    fn without_drivers_flag_nothing_is_injected() {
        use crate::catalog::EntryFlags;

        let catalog = PatchCatalog::builder()
            .flags(EntryFlags::default() - EntryFlags::WITH_DRIVERS)
            .force_driver("X")
            .build();
        let source =
            MemorySource::new(vec![0; 4]).with_driver("X", DriverImage::new("X", vec![1]));

        let handoff = PatchOrchestrator::new(attempt(source, catalog)).run().unwrap();
        assert!(handoff.drivers.is_empty());
        assert!(handoff.injection.personalities.is_none());
    }

    #[test]
    fn notification_fires_once() {
        let mut notification = ExitBootNotification::new();
        let catalog = PatchCatalog::builder().build();
        let first = attempt(MemorySource::new(vec![0; 4]), catalog);
        notification.register(first).unwrap();
        let second = attempt(MemorySource::default(), PatchCatalog::builder().build());
        assert!(matches!(
            notification.register(second),
            Err(Error::AlreadyRegistered)
        ));
        assert!(notification.is_armed());

        assert!(notification.signal().unwrap().is_ok());
        assert!(notification.signal().is_none());
        assert!(!notification.is_armed());
    }

    proptest! {
        #[test]
        fn disabled_directive_leaves_kernel_untouched(
            rest in prop::collection::vec(any::<u8>(), 0..64),
            len in 1usize..5,
        ) {
            let mut kernel = vec![0u8];
            kernel.extend_from_slice(&rest);
            let pattern = kernel[..len.min(kernel.len())].to_vec();
            let replacement: Vec<u8> = pattern.iter().map(|b| b.wrapping_add(1)).collect();
            let off = PatchDirective::new("off", pattern, replacement)
                .map(|d| d.with_enabled(false));
            let catalog = PatchCatalog::builder().core(off).build();
            let identity = BootIdentity::new("10.13", "17A365");
            prop_assert_eq!(catalog.eligible_core(&identity).count(), 0);

            let source = MemorySource::new(kernel.clone());
            let handoff = PatchOrchestrator::new(attempt(source, catalog)).run().unwrap();
            prop_assert_eq!(handoff.kernel, kernel);
            prop_assert!(handoff.report.records.is_empty());
            prop_assert_eq!(handoff.report.skipped, 1);
        }
    }
}
