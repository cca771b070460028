//! Multi-architecture ("fat") image handling.
//!
//! A fat image starts with a magic number and a slice count, followed by one
//! 20-byte record per architecture. The table is stored big-endian on disk, so
//! on the little-endian firmware the magic reads back byte-swapped and every
//! field must be swapped as well.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use crate::error::{Error, Result};

pub const FAT_MAGIC: u32 = 0xCAFE_BABE;
pub const FAT_CIGAM: u32 = 0xBEBA_FECA;

pub const THIN_IA32: u32 = 0xFEED_FACE;
pub const THIN_X64: u32 = 0xFEED_FACF;

/// Architecture bits of a cpu type.
pub const CPU_ARCH_MASK: i32 = 0xFF00_0000_u32 as i32;
pub const CPU_ARCH_ABI64: i32 = 0x0100_0000;

const FAT_HEADER_SIZE: usize = 8;
const FAT_ARCH_SIZE: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuType(pub i32);

impl CpuType {
    /// Matches any slice. Only ever used in requests, never stored in a table.
    pub const ANY: CpuType = CpuType(-1);
    pub const X86: CpuType = CpuType(7);
    pub const X86_64: CpuType = CpuType(7 | CPU_ARCH_ABI64);

    /// Whether a slice stored as `stored` satisfies this request.
    ///
    /// A generic request (no architecture bits) ignores the ABI width of the
    /// stored slice; a request carrying the 64-bit bit must match exactly.
    pub fn accepts(self, stored: CpuType) -> bool {
        if self == Self::ANY {
            return true;
        }
        if self.0 & CPU_ARCH_MASK != 0 {
            return self == stored;
        }
        stored.0 & !CPU_ARCH_MASK == self.0
    }
}

impl fmt::Display for CpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ANY => f.write_str("any"),
            Self::X86 => f.write_str("x86"),
            Self::X86_64 => f.write_str("x86_64"),
            CpuType(other) => write!(f, "{:#x}", other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchSlice {
    pub cpu_type: CpuType,
    pub cpu_subtype: i32,
    pub offset: u32,
    pub size: u32,
    /// Alignment as a power of two.
    pub align: u32,
}

impl ArchSlice {
    pub fn range(&self) -> Range<usize> {
        let start = self.offset as usize;
        start..start + self.size as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Fat { swapped: bool },
    Thin32,
    Thin64,
    Unknown,
}

impl ImageKind {
    pub fn detect(image: &[u8]) -> ImageKind {
        match read_u32(image, 0, false) {
            Some(FAT_MAGIC) => ImageKind::Fat { swapped: false },
            Some(FAT_CIGAM) => ImageKind::Fat { swapped: true },
            Some(THIN_IA32) => ImageKind::Thin32,
            Some(THIN_X64) => ImageKind::Thin64,
            _ => ImageKind::Unknown,
        }
    }
}

/// Outcome of a successful slice lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    /// Not a fat image; the whole buffer is used as is.
    Whole,
    Slice(ArchSlice),
}

impl Selection {
    pub fn view<'a>(&self, image: &'a [u8]) -> &'a [u8] {
        match self {
            Selection::Whole => image,
            Selection::Slice(slice) => &image[slice.range()],
        }
    }
}

fn read_u32(buf: &[u8], at: usize, swapped: bool) -> Option<u32> {
    let bytes: [u8; 4] = [
        *buf.get(at)?,
        *buf.get(at + 1)?,
        *buf.get(at + 2)?,
        *buf.get(at + 3)?,
    ];
    Some(if swapped {
        u32::from_be_bytes(bytes)
    } else {
        u32::from_le_bytes(bytes)
    })
}

/// Reads the architecture table of a fat image.
///
/// Returns `Ok(None)` when `image` is not a fat image.
pub fn slices(image: &[u8]) -> Result<Option<Vec<ArchSlice>>> {
    let swapped = match ImageKind::detect(image) {
        ImageKind::Fat { swapped } => swapped,
        _ => return Ok(None),
    };
    let truncated = |count| Error::FatHeaderTruncated {
        count,
        len: image.len(),
    };

    let count = read_u32(image, 4, swapped).ok_or_else(|| truncated(0))?;
    let table_end = (count as usize)
        .checked_mul(FAT_ARCH_SIZE)
        .and_then(|table| table.checked_add(FAT_HEADER_SIZE))
        .ok_or_else(|| truncated(count))?;
    if table_end > image.len() {
        return Err(truncated(count));
    }

    let mut table = Vec::with_capacity(count as usize);
    for record in image[FAT_HEADER_SIZE..table_end].chunks_exact(FAT_ARCH_SIZE) {
        // chunks_exact guarantees all five fields are present
        let field = |n: usize| read_u32(record, n * 4, swapped).unwrap_or_default();
        table.push(ArchSlice {
            cpu_type: CpuType(field(0) as i32),
            cpu_subtype: field(1) as i32,
            offset: field(2),
            size: field(3),
            align: field(4),
        });
    }
    Ok(Some(table))
}

/// Locates the slice of `image` matching `cpu`.
///
/// The first matching record in table order wins. Single-architecture images
/// yield [`Selection::Whole`].
pub fn locate(image: &[u8], cpu: CpuType) -> Result<Selection> {
    let table = match slices(image)? {
        Some(table) => table,
        None => return Ok(Selection::Whole),
    };

    let slice = table
        .into_iter()
        .find(|slice| cpu.accepts(slice.cpu_type))
        .ok_or(Error::SliceNotFound { cpu_type: cpu.0 })?;

    let end = slice.offset as u64 + slice.size as u64;
    if end > image.len() as u64 {
        return Err(Error::SliceOutOfBounds {
            cpu_type: slice.cpu_type.0,
            offset: slice.offset,
            size: slice.size,
            len: image.len(),
        });
    }
    Ok(Selection::Slice(slice))
}

/// Borrowed view of the slice matching `cpu`. The owner of `image` keeps the
/// allocation alive for as long as the view is used.
pub fn select(image: &[u8], cpu: CpuType) -> Result<&[u8]> {
    locate(image, cpu).map(|selection| selection.view(image))
}

/// Narrows `image` in place to the slice matching `cpu`.
///
/// On error the buffer is left untouched.
pub fn thin(image: &mut Vec<u8>, cpu: CpuType) -> Result<Selection> {
    let selection = locate(image, cpu)?;
    if let Selection::Slice(slice) = selection {
        let range = slice.range();
        image.truncate(range.end);
        image.drain(..range.start);
        image.shrink_to_fit();
    }
    Ok(selection)
}
