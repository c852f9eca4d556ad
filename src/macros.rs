//! # Internal Macros
//!
//! ## zerocopy_getters!
//!
//! Generates getter methods for zerocopy struct fields that use
//! little-endian wrapper types (U16, U32, U64), so on-disk structs read
//! naturally as native integers:
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct Header {
//!     version: U32,
//!     created_at: U64,
//! }
//!
//! impl Header {
//!     zerocopy_getters! {
//!         version: u32,
//!         created_at: u64,
//!     }
//! }
//! ```

/// Generates getter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
