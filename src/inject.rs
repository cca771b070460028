//! Force-loaded driver injection into the boot configuration buffer.
//!
//! Each driver is copied into its own page-aligned region appended to the
//! buffer and announced through a `Driver-<address>` memory-map property. A
//! personalities plist naming every injected driver is appended last, under
//! [`PERSONALITIES_KEY`], so the OS loader matches them without a cache.

use log::{debug, warn};
use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};

pub const PAGE_SIZE: usize = 0x1000;

/// Bundle identifier of the synthesized personalities plist.
pub const INJECTOR_IDENTITY: &str = "org.bootpatch.plist.injector";
pub const BUNDLE_VERSION: &str = "1.0.0";

/// Memory-map property holding the personalities plist.
pub const PERSONALITIES_KEY: &str = "DriverPersonalities";
const DRIVER_KEY_PREFIX: &str = "Driver-";

/// info address (u64), info length (u32), binary address (u64), binary length (u32)
const REGION_HEADER_SIZE: usize = 24;

pub fn round_page(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// A driver to be force-loaded, after slice selection and patching.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriverImage {
    pub identifier: String,
    pub binary: Vec<u8>,
    /// Info.plist text, may be empty.
    pub info: Vec<u8>,
    /// Load before other drivers, at root-device discovery time.
    pub required_early: bool,
}

impl DriverImage {
    pub fn new(identifier: impl Into<String>, binary: impl Into<Vec<u8>>) -> Self {
        DriverImage {
            identifier: identifier.into(),
            binary: binary.into(),
            ..Default::default()
        }
    }

    pub fn with_info(mut self, info: impl Into<Vec<u8>>) -> Self {
        self.info = info.into();
        self
    }

    pub fn with_required_early(mut self, required_early: bool) -> Self {
        self.required_early = required_early;
        self
    }

    /// Builds a driver from its bundle files. The identifier and the
    /// required-early flag come from the Info.plist when it names them.
    pub fn from_bundle(name: &str, binary: Vec<u8>, info: Vec<u8>) -> Self {
        let (identifier, required_early) = {
            let text = String::from_utf8_lossy(&info);
            (
                plist_string(&text, "CFBundleIdentifier")
                    .unwrap_or(name)
                    .to_string(),
                plist_string(&text, "OSBundleRequired").is_some(),
            )
        };
        DriverImage {
            identifier,
            binary,
            info,
            required_early,
        }
    }

    fn payload_len(&self) -> usize {
        REGION_HEADER_SIZE + self.info.len() + self.binary.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemoryMapEntry {
    pub name: String,
    pub address: u64,
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DriverRegion {
    pub identifier: String,
    pub address: u64,
    /// Page-rounded size of the whole region.
    pub size: usize,
    pub info_address: u64,
    pub info_len: usize,
    pub binary_address: u64,
    pub binary_len: usize,
}

/// The boot configuration buffer handed to the OS loader.
///
/// `data.len()` is the declared length. Growth is capped at `limit` bytes,
/// the size of the region the platform reserved for it.
#[derive(Clone, Debug)]
pub struct ConfigBuffer {
    base: u64,
    data: Vec<u8>,
    limit: usize,
    memory_map: Vec<MemoryMapEntry>,
}

impl ConfigBuffer {
    pub fn new(base: u64, data: Vec<u8>, limit: usize) -> Self {
        ConfigBuffer {
            base,
            data,
            limit,
            memory_map: Vec::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn memory_map(&self) -> &[MemoryMapEntry] {
        &self.memory_map
    }

    pub fn property(&self, name: &str) -> Option<&MemoryMapEntry> {
        self.memory_map.iter().find(|entry| entry.name == name)
    }

    /// Bytes of the region an entry points at.
    pub fn region(&self, entry: &MemoryMapEntry) -> Option<&[u8]> {
        let start = entry.address.checked_sub(self.base)? as usize;
        self.data.get(start..start + entry.size)
    }

    /// Bytes still available for new regions.
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(round_page(self.data.len()))
    }

    /// Checks that regions of the given lengths, appended one after another,
    /// stay within the limit. Nothing is allocated.
    fn reserve(&self, lens: &[usize]) -> Result<()> {
        let requested = lens.iter().map(|len| round_page(*len)).sum::<usize>();
        let fits = round_page(self.data.len())
            .checked_add(requested)
            .map_or(false, |end| end <= self.limit);
        if fits {
            Ok(())
        } else {
            Err(Error::ResourceExhausted {
                requested,
                available: self.available(),
            })
        }
    }

    /// Appends a page-aligned, page-rounded region of at least `len` bytes.
    /// Returns its address and its offset in `data`. Nothing is allocated on
    /// failure.
    fn grow(&mut self, len: usize) -> Result<(u64, usize, usize)> {
        let start = round_page(self.data.len());
        let size = round_page(len);
        let exhausted = Error::ResourceExhausted {
            requested: size,
            available: self.available(),
        };
        let end = match start.checked_add(size) {
            Some(end) if end <= self.limit => end,
            _ => return Err(exhausted),
        };
        if self.data.try_reserve(end - self.data.len()).is_err() {
            return Err(exhausted);
        }
        self.data.resize(end, 0);
        Ok((self.base + start as u64, start, size))
    }

    fn append_driver(&mut self, driver: &DriverImage) -> Result<DriverRegion> {
        let (address, offset, size) = self.grow(driver.payload_len())?;
        let info_address = address + REGION_HEADER_SIZE as u64;
        let binary_address = info_address + driver.info.len() as u64;

        let mut header = Vec::with_capacity(REGION_HEADER_SIZE);
        header.extend_from_slice(&info_address.to_le_bytes());
        header.extend_from_slice(&(driver.info.len() as u32).to_le_bytes());
        header.extend_from_slice(&binary_address.to_le_bytes());
        header.extend_from_slice(&(driver.binary.len() as u32).to_le_bytes());

        let region = &mut self.data[offset..offset + size];
        let (head, rest) = region.split_at_mut(REGION_HEADER_SIZE);
        head.copy_from_slice(&header);
        let (info, rest) = rest.split_at_mut(driver.info.len());
        info.copy_from_slice(&driver.info);
        rest[..driver.binary.len()].copy_from_slice(&driver.binary);

        self.memory_map.push(MemoryMapEntry {
            name: format!("{}{:x}", DRIVER_KEY_PREFIX, address),
            address,
            size,
        });
        Ok(DriverRegion {
            identifier: driver.identifier.clone(),
            address,
            size,
            info_address,
            info_len: driver.info.len(),
            binary_address,
            binary_len: driver.binary.len(),
        })
    }

    fn append_property(&mut self, name: &str, bytes: &[u8]) -> Result<MemoryMapEntry> {
        let (address, offset, size) = self.grow(bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        let entry = MemoryMapEntry {
            name: name.to_string(),
            address,
            size,
        };
        self.memory_map.push(entry.clone());
        Ok(entry)
    }
}

/// Value of the first `<string>` following `<key>name</key>`.
fn plist_string<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let tag = format!("<key>{}</key>", key);
    let rest = &text[text.find(&tag)? + tag.len()..];
    let start = rest.find("<string>")? + "<string>".len();
    let end = rest[start..].find("</string>")?;
    // the value must belong to this key, not a later one
    if rest[..start].contains("<key>") {
        return None;
    }
    Some(rest[start..start + end].trim())
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Personality of one injected driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorFragment {
    pub identifier: String,
    pub required_early: bool,
}

impl DescriptorFragment {
    pub fn of(driver: &DriverImage) -> Self {
        DescriptorFragment {
            identifier: driver.identifier.clone(),
            required_early: driver.required_early,
        }
    }
}

impl fmt::Display for DescriptorFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = escape(&self.identifier);
        writeln!(f, "    <key>{}</key>", id)?;
        writeln!(f, "    <dict>")?;
        for (key, value) in &[
            ("CFBundleIdentifier", id.as_str()),
            ("IOClass", id.as_str()),
            ("IOMatchCategory", id.as_str()),
            ("IOProviderClass", "IOResources"),
            ("IOResourceMatch", "IOKit"),
        ] {
            writeln!(f, "      <key>{}</key>", key)?;
            writeln!(f, "      <string>{}</string>", value)?;
        }
        if self.required_early {
            writeln!(f, "      <key>OSBundleRequired</key>")?;
            writeln!(f, "      <string>Root</string>")?;
        }
        writeln!(f, "    </dict>")
    }
}

/// Outer plist wrapping every fragment under `IOKitPersonalities`.
///
/// Fragments keep insertion order and duplicates are kept; the OS loader
/// resolves conflicts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersonalityDictionary {
    pub identity: String,
    pub version: String,
    pub fragments: Vec<DescriptorFragment>,
}

impl PersonalityDictionary {
    pub fn new(identity: impl Into<String>) -> Self {
        PersonalityDictionary {
            identity: identity.into(),
            version: BUNDLE_VERSION.to_string(),
            fragments: Vec::new(),
        }
    }

    pub fn push(&mut self, fragment: DescriptorFragment) {
        self.fragments.push(fragment);
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.fragments.iter().map(|f| f.identifier.as_str())
    }
}

impl fmt::Display for PersonalityDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, r#"<?xml version="1.0" encoding="UTF-8"?>"#)?;
        writeln!(
            f,
            r#"<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">"#
        )?;
        writeln!(f, r#"<plist version="1.0">"#)?;
        writeln!(f, "<dict>")?;
        let identity = escape(&self.identity);
        for (key, value) in &[
            ("CFBundleDevelopmentRegion", "English"),
            ("CFBundleIdentifier", identity.as_str()),
            ("CFBundleInfoDictionaryVersion", "6.0"),
            ("CFBundleName", identity.as_str()),
            ("CFBundlePackageType", "KEXT"),
            ("CFBundleSignature", "????"),
            ("CFBundleVersion", self.version.as_str()),
        ] {
            writeln!(f, "  <key>{}</key>", key)?;
            writeln!(f, "  <string>{}</string>", value)?;
        }
        writeln!(f, "  <key>IOKitPersonalities</key>")?;
        writeln!(f, "  <dict>")?;
        for fragment in &self.fragments {
            write!(f, "{}", fragment)?;
        }
        writeln!(f, "  </dict>")?;
        writeln!(f, "</dict>")?;
        writeln!(f, "</plist>")
    }
}

/// What [`inject`] managed to do.
#[derive(Debug, Default)]
pub struct InjectionOutcome {
    pub injected: Vec<DriverRegion>,
    /// Drivers not injected because the buffer could not grow, in order.
    pub abandoned: Vec<String>,
    pub personalities: Option<MemoryMapEntry>,
    /// The failure that cut injection short.
    pub error: Option<Error>,
}

impl InjectionOutcome {
    pub fn is_partial(&self) -> bool {
        self.error.is_some()
    }
}

/// Appends every driver to `config` in order, then the personalities plist.
///
/// A driver is only committed once its region and the plist naming it and
/// every earlier driver are known to fit, so injected drivers always get
/// their descriptors. The first driver that does not fit stops injection;
/// drivers already injected stay.
pub fn inject(
    config: &mut ConfigBuffer,
    drivers: &[DriverImage],
    identity: &str,
) -> InjectionOutcome {
    let mut outcome = InjectionOutcome::default();
    let mut personalities = PersonalityDictionary::new(identity);

    for (index, driver) in drivers.iter().enumerate() {
        personalities.push(DescriptorFragment::of(driver));
        let plist_len = personalities.to_string().len();
        let committed = config
            .reserve(&[driver.payload_len(), plist_len])
            .and_then(|()| config.append_driver(driver));
        match committed {
            Ok(region) => {
                debug!(
                    "injected {} at {:#x} (+{:#x})",
                    region.identifier, region.address, region.size
                );
                outcome.injected.push(region);
            }
            Err(error) => {
                personalities.fragments.pop();
                outcome.abandoned = drivers[index..]
                    .iter()
                    .map(|driver| driver.identifier.clone())
                    .collect();
                warn!(
                    "{}; abandoning {} driver(s) from {}",
                    error,
                    outcome.abandoned.len(),
                    driver.identifier
                );
                outcome.error = Some(error);
                break;
            }
        }
    }

    if !personalities.is_empty() {
        let plist = personalities.to_string();
        match config.append_property(PERSONALITIES_KEY, plist.as_bytes()) {
            Ok(entry) => outcome.personalities = Some(entry),
            Err(error) => {
                // only reachable when the allocator itself refuses
                warn!("personalities not injected: {}", error);
                outcome.error.get_or_insert(error);
            }
        }
    }
    outcome
}
