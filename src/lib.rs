#![no_std]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! In-memory validation and repair of redundant GPT partition tables.
//!
//! A GPT-formatted drive carries two copies of its partition metadata: a
//! primary header and entry table at the start of the drive, and a secondary
//! pair mirrored at the end. This crate checks both copies against the
//! format's invariants, decides which ones can be trusted, and rebuilds a
//! damaged copy from the surviving one. Everything operates over caller-owned
//! byte buffers, with no device I/O and no allocation, so it can run before
//! any filesystem driver is available.
//!
//! The entry point is [`GptImage`]: construct it from the four freshly-read
//! regions, run [`GptImage::sanity_check`], then [`GptImage::repair`] if the
//! validity masks report an invalid copy. The caller flushes whichever
//! regions [`GptImage::modified_regions`] reports back to the drive.

#[macro_use]
extern crate static_assertions;

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod gpt;
pub mod image;

pub use gpt::{check_entries, GptCopy, GptError, GptHeader, GptPartition};
pub use image::{GptImage, GptRegion, ModifiedRegions, Validity};

macro_rules! packed_field_accessors {
    ($field:ident, $type:ty) => {
        #[must_use]
        pub fn $field(&self) -> $type {
            unsafe { core::ptr::read_unaligned(core::ptr::addr_of!(self.$field)) }
        }
    };
    ($field:ident, $type:ty, $accq:vis) => {
        $accq fn $field(&self) -> $type {
            unsafe { core::ptr::read_unaligned(core::ptr::addr_of!(self.$field)) }
        }
    };
    ($field:ident, $field_setter:ident, $type:ty) => {
        #[must_use]
        pub fn $field(&self) -> $type {
            unsafe { core::ptr::read_unaligned(core::ptr::addr_of!(self.$field)) }
        }

        pub fn $field_setter(&mut self, value: $type) {
            unsafe { core::ptr::write_unaligned(core::ptr::addr_of_mut!(self.$field), value) }
        }
    };
    ($field:ident, $field_setter:ident, $type:ty, $accq:vis) => {
        $accq fn $field(&self) -> $type {
            unsafe { core::ptr::read_unaligned(core::ptr::addr_of!(self.$field)) }
        }

        $accq fn $field_setter(&mut self, value: $type) {
            unsafe { core::ptr::write_unaligned(core::ptr::addr_of_mut!(self.$field), value) }
        }
    };
}

pub(crate) use packed_field_accessors;
