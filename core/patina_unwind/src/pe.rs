use core::fmt;

use crate::{
    byte_reader::ByteReader,
    error::{Error, UnwindResult},
};

// PE header-related constants
const MZ_SIGNATURE: u16 = 0x5A4D; // 'MZ' in little-endian.
const PE_MAGIC_OFFSET: usize = 0x18;
const PE_POINTER_OFFSET: usize = 0x3C;
const PE_SIGNATURE: u32 = 0x0000_4550; // 'PE\0\0' in little-endian.
const PE64_EXECUTABLE: u16 = 0x20B; // PE32+
const SIZE_OF_IMAGE_OFFSET: usize = 0x50;
const EXCEPTION_TABLE_POINTER_PE64_OFFSET: usize = 0xA0;

/// A loaded PE32+ image viewed as bytes.
#[derive(Clone)]
pub struct PE<'a> {
    /// Image base of the PE image in memory.
    pub base_address: u64,

    /// Size of the image in memory.
    pub size_of_image: u32,

    /// Loaded image memory as a byte slice.
    pub(crate) bytes: &'a [u8],
}

impl fmt::Display for PE<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PE Image:\n  Base Address: 0x{:016X}\n  Size: {} bytes\n  Bytes: {} bytes",
            self.base_address,
            self.size_of_image,
            self.bytes.len()
        )
    }
}

impl fmt::Debug for PE<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PE")
            .field("base_address", &format_args!("0x{:016X}", self.base_address))
            .field("size_of_image", &self.size_of_image)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl<'a> PE<'a> {
    /// Validates the headers of an image mapped (or copied) into `bytes` and
    /// loaded at `base_address`.
    pub fn parse(bytes: &'a [u8], base_address: u64) -> UnwindResult<Self> {
        let malformed = |reason: &'static str| move |_: Error| Error::MalformedImage { reason };

        if bytes.read16(0).map_err(malformed("Truncated DOS header"))? != MZ_SIGNATURE {
            return Err(Error::MalformedImage { reason: "Missing MZ signature" });
        }

        let pe_header_offset = bytes.read32(PE_POINTER_OFFSET).map_err(malformed("Truncated DOS header"))? as usize;
        if bytes.read32(pe_header_offset).map_err(malformed("Truncated PE header"))? != PE_SIGNATURE {
            return Err(Error::MalformedImage { reason: "Missing PE signature" });
        }

        let pe_type = bytes.read16(pe_header_offset + PE_MAGIC_OFFSET).map_err(malformed("Truncated PE header"))?;
        if pe_type != PE64_EXECUTABLE {
            return Err(Error::MalformedImage { reason: "Not a PE32+ image" });
        }

        // This field contains the size of the entire loaded image in memory.
        let size_of_image =
            bytes.read32(pe_header_offset + SIZE_OF_IMAGE_OFFSET).map_err(malformed("Truncated PE header"))?;
        let Some(bytes) = bytes.get(..size_of_image as usize) else {
            return Err(Error::MalformedImage { reason: "Image is smaller than SizeOfImage" });
        };

        let pe = Self { base_address, size_of_image, bytes };
        log::debug!("{pe}");
        Ok(pe)
    }

    /// Views the image loaded at `base_address` in the current address space.
    ///
    /// # Safety
    ///
    /// `base_address` must point at a mapped PE image whose headers and whole
    /// `SizeOfImage` range stay readable for `'a`.
    pub unsafe fn from_base_address(base_address: u64) -> UnwindResult<Self> {
        if base_address == 0 {
            return Err(Error::MalformedImage { reason: "Null image base" });
        }

        // SAFETY: The caller guarantees the headers are mapped. Reading the
        // DOS header pointer and the optional header size field stays within
        // the first page of a valid image.
        let size_of_image = unsafe {
            let pe_header_offset = core::ptr::read_unaligned((base_address as usize + PE_POINTER_OFFSET) as *const u32);
            core::ptr::read_unaligned(
                (base_address as usize + pe_header_offset as usize + SIZE_OF_IMAGE_OFFSET) as *const u32,
            )
        };

        // SAFETY: The caller guarantees the full image range is readable for `'a`.
        let bytes = unsafe { core::slice::from_raw_parts(base_address as *const u8, size_of_image as usize) };
        Self::parse(bytes, base_address)
    }

    /// Returns the exception directory (`.pdata`) RVA and size.
    pub(crate) fn get_exception_table(&self) -> UnwindResult<(u32, u32)> {
        let pe_header_offset = self.bytes.read32(PE_POINTER_OFFSET)? as usize;
        let offset = pe_header_offset + EXCEPTION_TABLE_POINTER_PE64_OFFSET;
        let exception_table_rva = self.bytes.read32(offset)?;
        let exception_table_size = self.bytes.read32(offset + 4)?;

        // Bail out if the exception table section (the `.pdata` section) is not
        // available.
        if exception_table_rva == 0 || exception_table_size == 0 {
            return Err(Error::ExceptionDirectoryNotFound);
        }

        Ok((exception_table_rva, exception_table_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::{vec, vec::Vec};

    fn make_fake_pe_image() -> Vec<u8> {
        let mut bytes = vec![0u8; 0x2000];

        bytes[0..2].copy_from_slice(&MZ_SIGNATURE.to_le_bytes());

        let pe_header_offset = 0x80u32;
        bytes[PE_POINTER_OFFSET..PE_POINTER_OFFSET + 4].copy_from_slice(&pe_header_offset.to_le_bytes());

        let header = pe_header_offset as usize;
        bytes[header..header + 4].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
        bytes[header + PE_MAGIC_OFFSET..header + PE_MAGIC_OFFSET + 2].copy_from_slice(&PE64_EXECUTABLE.to_le_bytes());
        bytes[header + SIZE_OF_IMAGE_OFFSET..header + SIZE_OF_IMAGE_OFFSET + 4]
            .copy_from_slice(&0x2000u32.to_le_bytes());

        bytes
    }

    #[test]
    fn parse_valid_image_without_exception_directory() {
        let bytes = make_fake_pe_image();
        let pe = PE::parse(&bytes, 0x1_0000).unwrap();
        assert_eq!(pe.base_address, 0x1_0000);
        assert_eq!(pe.size_of_image, 0x2000);
        assert_eq!(pe.get_exception_table().unwrap_err(), Error::ExceptionDirectoryNotFound);
        assert!(format!("{pe}").contains("Base Address: 0x0000000000010000"));
    }

    #[test]
    fn parse_reports_exception_directory() {
        let mut bytes = make_fake_pe_image();
        let offset = 0x80 + EXCEPTION_TABLE_POINTER_PE64_OFFSET;
        bytes[offset..offset + 4].copy_from_slice(&0x300u32.to_le_bytes());
        bytes[offset + 4..offset + 8].copy_from_slice(&0x18u32.to_le_bytes());
        let pe = PE::parse(&bytes, 0).unwrap();
        assert_eq!(pe.get_exception_table().unwrap(), (0x300, 0x18));
    }

    #[test]
    fn parse_rejects_bad_headers() {
        let mut bytes = make_fake_pe_image();
        bytes[0] = 0;
        assert_eq!(PE::parse(&bytes, 0).unwrap_err(), Error::MalformedImage { reason: "Missing MZ signature" });

        let mut bytes = make_fake_pe_image();
        bytes[0x80] = 0;
        assert_eq!(PE::parse(&bytes, 0).unwrap_err(), Error::MalformedImage { reason: "Missing PE signature" });

        let mut bytes = make_fake_pe_image();
        bytes[0x80 + PE_MAGIC_OFFSET..0x80 + PE_MAGIC_OFFSET + 2].copy_from_slice(&0x10Bu16.to_le_bytes());
        assert_eq!(PE::parse(&bytes, 0).unwrap_err(), Error::MalformedImage { reason: "Not a PE32+ image" });

        let bytes = make_fake_pe_image();
        assert_eq!(PE::parse(&bytes[..0x1000], 0).unwrap_err(), Error::MalformedImage {
            reason: "Image is smaller than SizeOfImage"
        });

        assert_eq!(PE::parse(&[0x4D], 0).unwrap_err(), Error::MalformedImage { reason: "Truncated DOS header" });
    }

    #[test]
    fn debug_output_summarizes_image() {
        let bytes = make_fake_pe_image();
        let pe = PE::parse(&bytes, 0x40_0000).unwrap();
        assert_eq!(
            format!("{pe:?}"),
            format!("PE {{ base_address: 0x0000000000400000, size_of_image: {}, bytes: {} }}", pe.size_of_image, pe.bytes.len())
        );
    }

    #[test]
    fn from_base_address_views_mapped_image() {
        let bytes = make_fake_pe_image();
        let base = bytes.as_ptr() as u64;
        let pe = unsafe { PE::from_base_address(base) }.unwrap();
        assert_eq!(pe.base_address, base);
        assert_eq!(pe.size_of_image, 0x2000);
        assert!(unsafe { PE::from_base_address(0) }.is_err());
    }
}
