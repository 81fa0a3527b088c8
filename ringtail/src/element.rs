//! Row types that can live in a segment's data region.
//!
//! A segment stores `capacity` rows of one fixed-size type. The type is
//! described in the array header with an NPY descriptor literal (for example
//! `'<u8'` or `[('a', '<i4'), ('b', '<f4')]`) plus a per-row sub-shape, so a
//! generic `.npy` reader sees a `(capacity, *sub_shape)` array.
//!
//! # Structured records
//!
//! ```rust
//! use ringtail::Element;
//!
//! #[repr(C)]
//! #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
//! struct Tick {
//!     price: f64,
//!     volume: u32,
//!     flags: u32,
//! }
//!
//! impl Element for Tick {
//!     fn descr() -> String {
//!         "[('price', '<f8'), ('volume', '<u4'), ('flags', '<u4')]".to_string()
//!     }
//! }
//! ```

use bytemuck::Pod;

/// A fixed-size, plain-old-data row type.
///
/// `Pod` guarantees every bit pattern is a valid value, which is what makes it
/// sound to view mapped file bytes as `&[Self]`.
pub trait Element: Pod + Send + Sync {
    /// NPY descriptor literal as it appears after `'descr': ` in the header.
    fn descr() -> String;

    /// Trailing dimensions of one row. Empty for scalar rows.
    fn sub_shape() -> Vec<usize> {
        Vec::new()
    }
}

/// Byte-order prefix for multi-byte scalars on this host.
const fn order_char() -> char {
    if cfg!(target_endian = "little") { '<' } else { '>' }
}

macro_rules! scalar_element {
    ($($ty:ty => $kind:literal, $size:literal;)*) => {
        $(
            impl Element for $ty {
                fn descr() -> String {
                    if $size == 1 {
                        format!("'|{}{}'", $kind, $size)
                    } else {
                        format!("'{}{}{}'", order_char(), $kind, $size)
                    }
                }
            }
        )*
    };
}

scalar_element! {
    u8 => 'u', 1;
    u16 => 'u', 2;
    u32 => 'u', 4;
    u64 => 'u', 8;
    i8 => 'i', 1;
    i16 => 'i', 2;
    i32 => 'i', 4;
    i64 => 'i', 8;
    f32 => 'f', 4;
    f64 => 'f', 8;
}

impl<T: Element, const N: usize> Element for [T; N]
where
    [T; N]: Pod,
{
    fn descr() -> String {
        T::descr()
    }

    fn sub_shape() -> Vec<usize> {
        let mut shape = Vec::with_capacity(1 + T::sub_shape().len());
        shape.push(N);
        shape.extend(T::sub_shape());
        shape
    }
}

/// Normalizes a descriptor literal for comparison.
///
/// Writers differ in spacing and quote style (`"<u8"` vs `'<u8'`), so both are
/// dropped before comparing.
pub(crate) fn normalize_descr(descr: &str) -> String {
    descr
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '"' { '\'' } else { c })
        .collect()
}

/// Size in bytes of one row of `T`.
#[inline]
pub(crate) fn row_bytes<T: Element>() -> usize {
    std::mem::size_of::<T>()
}
