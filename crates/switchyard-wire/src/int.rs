//! Fixed-width big-endian integer access at arbitrary buffer offsets.
//!
//! Out-of-range accesses return [`OutOfBounds`] instead of panicking.

use thiserror::Error;

/// An integer access did not fit inside the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{width}-byte access at offset {offset} exceeds buffer of {len} bytes")]
pub struct OutOfBounds {
    pub offset: usize,
    pub width: usize,
    pub len: usize,
}

fn range(len: usize, offset: usize, width: usize) -> Result<std::ops::Range<usize>, OutOfBounds> {
    match offset.checked_add(width) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(OutOfBounds { offset, width, len }),
    }
}

macro_rules! int_access {
    ($($ty:ty => $get:ident, $put:ident;)*) => {
        $(
            #[doc = concat!("Read a big-endian `", stringify!($ty), "` at `offset`.")]
            pub fn $get(buf: &[u8], offset: usize) -> Result<$ty, OutOfBounds> {
                const W: usize = std::mem::size_of::<$ty>();
                let r = range(buf.len(), offset, W)?;
                let mut raw = [0u8; W];
                raw.copy_from_slice(&buf[r]);
                Ok(<$ty>::from_be_bytes(raw))
            }

            #[doc = concat!("Write a big-endian `", stringify!($ty), "` at `offset`.")]
            pub fn $put(buf: &mut [u8], offset: usize, value: $ty) -> Result<(), OutOfBounds> {
                const W: usize = std::mem::size_of::<$ty>();
                let r = range(buf.len(), offset, W)?;
                buf[r].copy_from_slice(&value.to_be_bytes());
                Ok(())
            }
        )*
    };
}

int_access! {
    u8 => get_u8, put_u8;
    u16 => get_u16, put_u16;
    u32 => get_u32, put_u32;
    u64 => get_u64, put_u64;
    i32 => get_i32, put_i32;
    i64 => get_i64, put_i64;
}
