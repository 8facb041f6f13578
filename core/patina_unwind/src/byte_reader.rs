use crate::error::{Error, UnwindResult};

/// Little-endian field reads from a byte slice with bounds checking. Unwind
/// records and PE headers are decoded field by field instead of overlaying
/// structures, so alignment and endianness never depend on the host.
pub(crate) trait ByteReader {
    fn read8(&self, index: usize) -> UnwindResult<u8>;
    fn read16(&self, index: usize) -> UnwindResult<u16>;
    fn read32(&self, index: usize) -> UnwindResult<u32>;
    fn read8_with(&self, index: &mut usize) -> UnwindResult<u8>;
    fn read16_with(&self, index: &mut usize) -> UnwindResult<u16>;
    fn read32_with(&self, index: &mut usize) -> UnwindResult<u32>;
}

fn read_array<const N: usize>(bytes: &[u8], index: usize) -> UnwindResult<[u8; N]> {
    index
        .checked_add(N)
        .and_then(|end| bytes.get(index..end))
        .and_then(|slice| slice.try_into().ok())
        .ok_or(Error::OutOfBoundsRead { index })
}

fn advance<T>(index: &mut usize, value: UnwindResult<T>) -> UnwindResult<T> {
    let value = value?;
    *index += core::mem::size_of::<T>();
    Ok(value)
}

impl ByteReader for [u8] {
    fn read8(&self, index: usize) -> UnwindResult<u8> {
        read_array::<1>(self, index).map(u8::from_le_bytes)
    }

    fn read16(&self, index: usize) -> UnwindResult<u16> {
        read_array::<2>(self, index).map(u16::from_le_bytes)
    }

    fn read32(&self, index: usize) -> UnwindResult<u32> {
        read_array::<4>(self, index).map(u32::from_le_bytes)
    }

    fn read8_with(&self, index: &mut usize) -> UnwindResult<u8> {
        advance(index, self.read8(*index))
    }

    fn read16_with(&self, index: &mut usize) -> UnwindResult<u16> {
        advance(index, self.read16(*index))
    }

    fn read32_with(&self, index: &mut usize) -> UnwindResult<u32> {
        advance(index, self.read32(*index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read8() {
        let buffer = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(buffer.read8(0).unwrap(), 0x12);
        assert_eq!(buffer.read8(3).unwrap(), 0x78);
        assert!(buffer.read8(4).is_err());
    }

    #[test]
    fn test_read16() {
        let buffer = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(buffer.read16(0).unwrap(), 0x3412);
        assert_eq!(buffer.read16(2).unwrap(), 0x7856);
        assert!(buffer.read16(3).is_err());
    }

    #[test]
    fn test_read32() {
        let buffer = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(buffer.read32(0).unwrap(), 0x78563412);
        assert!(buffer.read32(1).is_err());
    }

    #[test]
    fn test_read_with_advances_only_on_success() {
        let buffer = [0x12, 0x34, 0x56, 0x78, 0x9A];
        let mut index = 0;
        assert_eq!(buffer.read8_with(&mut index).unwrap(), 0x12);
        assert_eq!(index, 1);
        assert_eq!(buffer.read16_with(&mut index).unwrap(), 0x5634);
        assert_eq!(index, 3);
        assert!(buffer.read32_with(&mut index).is_err());
        assert_eq!(index, 3);
        assert_eq!(buffer.read16_with(&mut index).unwrap(), 0x9A78);
        assert_eq!(index, 5);
    }

    #[test]
    fn test_index_overflow_is_out_of_bounds() {
        let buffer = [0u8; 4];
        assert_eq!(buffer.read32(usize::MAX).unwrap_err(), Error::OutOfBoundsRead { index: usize::MAX });
    }

    #[test]
    fn test_error_out_of_bounds_read() {
        let buffer = [0x12, 0x34];
        assert_eq!(buffer.read8(2).unwrap_err(), Error::OutOfBoundsRead { index: 2 });
        assert_eq!(buffer.read16(1).unwrap_err(), Error::OutOfBoundsRead { index: 1 });
        assert_eq!(buffer.read32(0).unwrap_err(), Error::OutOfBoundsRead { index: 0 });
    }
}
