use alloc::vec::Vec;
use core::{fmt, ops::Range};

use super::unwind::UnwindInfo;
use crate::{
    byte_reader::ByteReader,
    error::{Error, UnwindResult},
    pe::PE,
};

/// `RuntimeFunction`
/// Source: <https://learn.microsoft.com/en-us/cpp/build/exception-handling-x64?view=msvc-170#struct-runtime_function>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeFunction {
    /// Start of the function RVA.
    pub start_rva: u32,

    /// End of the function RVA.
    pub end_rva: u32,

    /// RVA for the unwind info.
    pub unwind_info_rva: u32,
}

impl fmt::Display for RuntimeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RuntimeFunction {{ start_rva: 0x{:08X}, end_rva: 0x{:08X}, unwind_info: 0x{:08X} }}",
            self.start_rva, self.end_rva, self.unwind_info_rva
        )
    }
}

impl RuntimeFunction {
    pub(crate) const SIZE: usize = core::mem::size_of::<u32>() * 3;

    /// Parses one 12-byte `.pdata` record.
    pub fn parse(bytes: &[u8]) -> UnwindResult<Self> {
        let mut index = 0;
        Ok(Self {
            start_rva: bytes.read32_with(&mut index)?,
            end_rva: bytes.read32_with(&mut index)?,
            unwind_info_rva: bytes.read32_with(&mut index)?,
        })
    }
}

/// Maps the code range `[start, end)` to its unwind metadata. A function
/// without metadata is a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionEntry {
    pub start: u64,
    pub end: u64,
    pub unwind_info: Option<UnwindInfo>,
}

impl FunctionEntry {
    pub fn new(start: u64, end: u64, unwind_info: UnwindInfo) -> Self {
        Self { start, end, unwind_info: Some(unwind_info) }
    }

    pub fn leaf(start: u64, end: u64) -> Self {
        Self { start, end, unwind_info: None }
    }

    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }
}

/// What the table knows about an instruction pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedFunction<'a> {
    /// Start of the owning function, or of the code region for leaves found by region.
    pub start: u64,
    pub unwind_info: Option<&'a UnwindInfo>,
}

impl ResolvedFunction<'_> {
    pub fn is_leaf(&self) -> bool {
        self.unwind_info.map_or(true, UnwindInfo::is_empty)
    }
}

/// Immutable address-range lookup from code addresses to unwind metadata.
///
/// Built once and shared read-only between unwinders.
#[derive(Debug, Default, Clone)]
pub struct FunctionTable {
    functions: Vec<FunctionEntry>,
    code_regions: Vec<Range<u64>>,
}

impl FunctionTable {
    pub fn builder() -> FunctionTableBuilder {
        FunctionTableBuilder::default()
    }

    pub fn functions(&self) -> &[FunctionEntry] {
        &self.functions
    }

    /// Locates the function owning `rip`.
    ///
    /// An address inside a known code region but outside every function entry
    /// belongs to a leaf function, which the ABI lets omit its entry.
    pub fn resolve(&self, rip: u64) -> UnwindResult<ResolvedFunction<'_>> {
        let index = self.functions.partition_point(|function| function.end <= rip);
        if let Some(function) = self.functions.get(index).filter(|function| function.contains(rip)) {
            return Ok(ResolvedFunction { start: function.start, unwind_info: function.unwind_info.as_ref() });
        }

        self.code_regions
            .iter()
            .find(|region| region.contains(&rip))
            .map(|region| ResolvedFunction { start: region.start, unwind_info: None })
            .ok_or(Error::UnresolvedAddress { rip })
    }
}

/// Collects function entries and code regions before freezing them into a
/// [`FunctionTable`].
#[derive(Debug, Default)]
pub struct FunctionTableBuilder {
    functions: Vec<FunctionEntry>,
    code_regions: Vec<Range<u64>>,
}

impl FunctionTableBuilder {
    pub fn function(mut self, entry: FunctionEntry) -> Self {
        self.functions.push(entry);
        self
    }

    /// Registers `region` as known code. Addresses in it without a function
    /// entry unwind as leaves.
    pub fn code_region(mut self, region: Range<u64>) -> Self {
        self.code_regions.push(region);
        self
    }

    /// Adds every `.pdata` record of a loaded image and registers the image as
    /// a code region.
    pub fn image(mut self, pe: &PE<'_>) -> UnwindResult<Self> {
        let (exception_table_rva, exception_table_size) = pe.get_exception_table()?;

        if (exception_table_size as usize) < RuntimeFunction::SIZE {
            return Err(Error::MalformedImage { reason: "Invalid exception table size < 12 bytes" });
        }

        let start = exception_table_rva as usize;
        let Some(table) = start.checked_add(exception_table_size as usize).and_then(|end| pe.bytes.get(start..end))
        else {
            return Err(Error::MalformedImage { reason: "Exception table lies outside the image" });
        };

        // Break the `.pdata` section into 12-byte records, skipping a
        // trailing partial record.
        for record in table.chunks_exact(RuntimeFunction::SIZE) {
            let function = RuntimeFunction::parse(record)?;
            if function.start_rva >= function.end_rva {
                return Err(Error::MalformedImage { reason: "Runtime function with an empty range" });
            }
            if function.end_rva > pe.size_of_image {
                return Err(Error::MalformedImage { reason: "Runtime function lies outside the image" });
            }
            log::debug!("{function}");

            let unwind_info = UnwindInfo::parse_in_image(pe.bytes, function.unwind_info_rva)?;
            self.functions.push(FunctionEntry::new(
                image_address(pe, function.start_rva)?,
                image_address(pe, function.end_rva)?,
                unwind_info,
            ));
        }

        self.code_regions.push(pe.base_address..image_address(pe, pe.size_of_image)?);
        Ok(self)
    }

    /// Sorts the entries and rejects overlapping functions.
    pub fn build(mut self) -> UnwindResult<FunctionTable> {
        self.functions.sort_by_key(|function| function.start);

        if self.functions.iter().any(|function| function.start >= function.end) {
            return Err(Error::MalformedUnwindInfo { reason: "Function entry with an empty range" });
        }
        if self.functions.windows(2).any(|pair| pair[0].end > pair[1].start) {
            return Err(Error::MalformedUnwindInfo { reason: "Overlapping function entries" });
        }

        Ok(FunctionTable { functions: self.functions, code_regions: self.code_regions })
    }
}

fn image_address(pe: &PE<'_>, rva: u32) -> UnwindResult<u64> {
    pe.base_address
        .checked_add(u64::from(rva))
        .ok_or(Error::MalformedImage { reason: "Image range overflows the address space" })
}
