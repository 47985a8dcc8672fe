//! # Header Field Macros
//!
//! The on-disk headers (database header, B-tree page header, WAL header and
//! frame header) are `#[repr(C)]` zerocopy structs whose integer fields are
//! stored big-endian. These macros generate the native-typed accessors so the
//! byte order never leaks into call sites.
//!
//! ```ignore
//! #[repr(C)]
//! struct FrameHeader {
//!     page_no: U32,
//!     flags: u8,
//! }
//!
//! impl FrameHeader {
//!     be_accessors! { page_no: u32, flags: u8 }
//! }
//!
//! // page_no(&self) -> u32, set_page_no(&mut self, u32),
//! // flags(&self) -> u8,    set_flags(&mut self, u8)
//! ```
//!
//! `be_getters!` emits the getters only, for fields that are written as a
//! unit (checksums, magic numbers) rather than one at a time.

/// Reads a header field as its native integer type.
#[doc(hidden)]
#[macro_export]
macro_rules! be_read {
    ($place:expr, u8) => {
        $place
    };
    ($place:expr, $ty:tt) => {
        $place.get()
    };
}

/// Stores a native integer into a header field.
#[doc(hidden)]
#[macro_export]
macro_rules! be_write {
    ($place:expr, $val:expr, u8) => {
        $place = $val
    };
    ($place:expr, $val:expr, u16) => {
        $place = ::zerocopy::big_endian::U16::new($val)
    };
    ($place:expr, $val:expr, u32) => {
        $place = ::zerocopy::big_endian::U32::new($val)
    };
}

/// Getters for big-endian header fields.
#[macro_export]
macro_rules! be_getters {
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $ty {
                $crate::be_read!(self.$field, $ty)
            }
        )*
    };
}

/// Getters plus `set_<field>` setters for big-endian header fields.
#[macro_export]
macro_rules! be_accessors {
    ($($field:ident : $ty:tt),* $(,)?) => {
        $crate::be_getters! { $($field: $ty),* }

        ::paste::paste! {
            $(
                #[inline]
                pub fn [<set_ $field>](&mut self, val: $ty) {
                    $crate::be_write!(self.$field, val, $ty);
                }
            )*
        }
    };
}
