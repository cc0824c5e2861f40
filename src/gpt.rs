//! GPT (_GUID Partition Table_) on-disk structures and validation.
//!
//! A GPT drive stores its metadata twice: the primary header lives in the
//! sector right after the protective MBR, immediately followed by its entry
//! table, while the secondary copy mirrors that arrangement at the end of the
//! drive (entry table first, header in the very last sector). Either copy is
//! enough to read the drive; this module knows how to decide whether a given
//! copy can be trusted.
//!
//! Layouts are bit-exact with the on-disk format: every structure is
//! `#[repr(C, packed(1))]` with its size pinned by a compile-time assertion,
//! and multi-byte fields are accessed through unaligned reads.

use core::fmt;
#[cfg(feature = "alloc")]
use core::ptr::{addr_of, read_unaligned};

#[cfg(feature = "alloc")]
use alloc::{string::String, vec::Vec};

use zerocopy::{transmute_mut, transmute_ref, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::packed_field_accessors;

/// Size of a logical block, in bytes. Only 512-byte sectors are supported.
pub const SECTOR_SIZE: usize = 512;

/// Canonical header signature, `"EFI PART"`.
pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

/// Alternate accepted signature.
///
/// Some firmware rewrites the signature of an otherwise intact table to this
/// value so that EFI-aware operating systems ignore it; such a table is still
/// structurally a GPT and must validate.
pub const GPT_SIGNATURE_ALT: &[u8; 8] = b"CHROMEOS";

/// The only supported header revision (1.0).
pub const GPT_REVISION: u32 = 0x0001_0000;

/// Smallest accepted value for the header's declared size.
pub const MIN_HEADER_SIZE: u32 = 92;

/// Largest accepted value for the header's declared size (one full sector).
pub const MAX_HEADER_SIZE: u32 = SECTOR_SIZE as u32;

/// On-disk size of a single partition entry record.
pub const GPT_ENTRY_SIZE: usize = 128;

/// Smallest accepted entry count.
pub const MIN_ENTRIES: u32 = 32;

/// Largest accepted entry count.
pub const MAX_ENTRIES: u32 = 128;

/// Fixed byte size of one full entry table copy.
pub const TOTAL_ENTRIES_SIZE: usize = GPT_ENTRY_SIZE * MAX_ENTRIES as usize;

/// Sectors occupied by one entry table copy.
pub const GPT_ENTRIES_SECTORS: u64 = (TOTAL_ENTRIES_SIZE / SECTOR_SIZE) as u64;

/// Smallest drive able to hold a protective MBR plus both metadata copies.
pub const MIN_DRIVE_SECTORS: u64 = 1 + 2 * (1 + GPT_ENTRIES_SECTORS);

/// Type GUID marking a bootable kernel partition
/// (`FE3A2A5D-4F32-41A7-B725-ACCC3285A309`).
pub const KERNEL_TYPE_GUID: u128 = u128::from_le_bytes([
    0x5d, 0x2a, 0x3a, 0xfe, 0x32, 0x4f, 0xa7, 0x41, 0xb7, 0x25, 0xac, 0xcc, 0x32, 0x85, 0xa3, 0x09,
]);

/// Byte offset of the `checksum` field inside the header.
const CHECKSUM_OFFSET: usize = 16;

/// Legacy-BIOS-bootable flag, bit 2 of the attribute word.
const ATTR_LEGACY_BOOTABLE: u64 = 1 << 2;

/// Boot priority occupies bits 48..=51 of the attribute word.
const ATTR_PRIORITY_SHIFT: u32 = 48;
const ATTR_PRIORITY_MASK: u64 = 0xF << ATTR_PRIORITY_SHIFT;

/// Remaining boot attempts occupy bits 52..=55 of the attribute word.
const ATTR_TRIES_SHIFT: u32 = 52;
const ATTR_TRIES_MASK: u64 = 0xF << ATTR_TRIES_SHIFT;

/// Successful-boot flag, bit 56 of the attribute word.
const ATTR_SUCCESSFUL_SHIFT: u32 = 56;
const ATTR_SUCCESSFUL_MASK: u64 = 1 << ATTR_SUCCESSFUL_SHIFT;

/// Error type for every fallible operation on a GPT.
///
/// The numeric taxonomy matches what pre-boot consumers of this crate expect:
/// each failure is a specific code, never a panic, and a code is only ever
/// produced by the check it names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GptError {
    /// No bootable kernel entry satisfies the selection policy.
    NoValidKernel,

    /// Neither header copy passed structural validation.
    InvalidHeaders,

    /// No entry table copy validated against any trusted header.
    InvalidEntries,

    /// The drive's sector size is not 512 bytes.
    InvalidSectorSize,

    /// The drive is too small to hold two metadata copies.
    InvalidSectorCount,

    /// An update request named an unknown update type.
    InvalidUpdateType,

    /// The entry table's CRC32 does not match the header's claim.
    EntriesCrcCorrupted,

    /// A used entry lies outside the usable block range.
    EntryOutOfRegion,

    /// A used entry's first block falls inside another entry.
    StartLbaOverlap,

    /// A used entry's last block falls inside another entry.
    EndLbaOverlap,

    /// Two used entries share the same unique GUID.
    DuplicateGuid,

    /// The flash geometry reported by the device is unusable.
    InvalidFlashGeometry,

    /// The requested entry does not exist.
    NoSuchEntry,
}

impl GptError {
    /// Short human-readable description of this error.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            GptError::NoValidKernel => "no valid kernel entry",
            GptError::InvalidHeaders => "invalid headers",
            GptError::InvalidEntries => "invalid entries",
            GptError::InvalidSectorSize => "invalid sector size",
            GptError::InvalidSectorCount => "invalid sector count",
            GptError::InvalidUpdateType => "invalid update type",
            GptError::EntriesCrcCorrupted => "entries crc corrupted",
            GptError::EntryOutOfRegion => "entry outside of usable region",
            GptError::StartLbaOverlap => "starting lba overlaps",
            GptError::EndLbaOverlap => "ending lba overlaps",
            GptError::DuplicateGuid => "duplicated unique guid",
            GptError::InvalidFlashGeometry => "invalid flash geometry",
            GptError::NoSuchEntry => "no such entry",
        }
    }
}

impl fmt::Display for GptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Identifies one of the two redundant metadata copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GptCopy {
    /// The copy at the start of the drive (header in sector 1).
    Primary,

    /// The mirrored copy at the end of the drive (header in the last sector).
    Secondary,
}

/// One copy of the GPT header, covering its full sector.
///
/// The declared header size is usually 92 bytes, but the checksum may cover
/// up to a whole sector, so the trailing padding is carried here rather than
/// discarded. Validation ignores the padding's contents.
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct GptHeader {
    /// Identifies an EFI-compatible partition table header.
    signature: [u8; 8],

    /// Revision number for this header.
    revision: u32,

    /// Declared size of the header in bytes.
    size: u32,

    /// CRC32 checksum for the header, computed with this field zeroed.
    checksum: u32,
    reserved: [u8; 4],

    /// The LBA that contains this copy of the header.
    lba: u64,

    /// The LBA of the other copy of the header.
    alternate_lba: u64,

    /// First logical block that may be used by a partition.
    first_usable_lba: u64,

    /// Last logical block that may be used by a partition.
    last_usable_lba: u64,

    /// GUID used to identify the disk.
    guid: u128,

    /// Starting LBA of this copy's partition entry array.
    partition_start_lba: u64,

    /// Number of entries in the partition entry array.
    partition_entries_count: u32,

    /// Size in bytes of each entry in the partition entry array.
    partition_entry_size: u32,

    /// CRC32 of the partition entry array.
    partition_entries_checksum: u32,

    padding: [u8; SECTOR_SIZE - MIN_HEADER_SIZE as usize],
}

assert_eq_size!(GptHeader, [u8; SECTOR_SIZE]);
assert_eq_align!(GptHeader, u8);

impl GptHeader {
    /// Borrows a header view over a raw sector.
    #[must_use]
    pub fn from_sector(sector: &[u8; SECTOR_SIZE]) -> &Self {
        transmute_ref!(sector)
    }

    /// Borrows a mutable header view over a raw sector.
    pub fn from_sector_mut(sector: &mut [u8; SECTOR_SIZE]) -> &mut Self {
        transmute_mut!(sector)
    }

    /// Computes the CRC32 this header should carry.
    ///
    /// The checksum spans the declared header size with the checksum field
    /// itself zeroed. The declared size is validated separately; it is
    /// clamped here so a garbage header cannot index past the sector.
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let size = (self.size() as usize).clamp(MIN_HEADER_SIZE as usize, SECTOR_SIZE);
        let bytes = self.as_bytes();

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..CHECKSUM_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&bytes[CHECKSUM_OFFSET + 4..size]);
        hasher.finalize()
    }

    /// Recomputes and stores this header's checksum.
    ///
    /// Must be called after any field edit, or the header will no longer
    /// validate.
    pub fn update_checksum(&mut self) {
        let checksum = self.compute_checksum();
        self.set_checksum(checksum);
    }

    /// Checks this header copy's full structural validity for its role.
    ///
    /// Every invariant of the format is verified, short-circuiting on the
    /// first failure: signature, revision, declared size, checksum, reserved
    /// field, entry record size and count, the role-specific location of the
    /// header and its entry table, and the usable block range. There is no
    /// partial credit; a header failing any check must not be trusted at all.
    #[must_use]
    pub fn is_valid(&self, copy: GptCopy, drive_sectors: u64) -> bool {
        let signature = self.signature();
        if signature != *GPT_SIGNATURE && signature != *GPT_SIGNATURE_ALT {
            return false;
        }
        if self.revision() != GPT_REVISION {
            return false;
        }
        if self.size() < MIN_HEADER_SIZE || self.size() > MAX_HEADER_SIZE {
            return false;
        }

        // Checksum before trusting any remaining field.
        if self.compute_checksum() != self.checksum() {
            return false;
        }

        if self.reserved() != [0u8; 4] {
            return false;
        }

        // Any entry size 2^n with n >= 7 is technically legal, but records of
        // a different size than ours cannot be parsed.
        if self.partition_entry_size() as usize != GPT_ENTRY_SIZE {
            return false;
        }
        let count = self.partition_entries_count();
        if count < MIN_ENTRIES
            || count > MAX_ENTRIES
            || count as usize * GPT_ENTRY_SIZE != TOTAL_ENTRIES_SIZE
        {
            return false;
        }

        // The location arithmetic below underflows on drives smaller than
        // the minimum layout.
        if drive_sectors < MIN_DRIVE_SECTORS {
            return false;
        }

        // The primary header immediately follows the protective MBR and is
        // followed by its entries; the secondary sits in the last sector,
        // preceded by its entries.
        match copy {
            GptCopy::Primary => {
                if self.lba() != 1 {
                    return false;
                }
                if self.partition_start_lba() != self.lba() + 1 {
                    return false;
                }
            }
            GptCopy::Secondary => {
                if self.lba() != drive_sectors - 1 {
                    return false;
                }
                if self.partition_start_lba() != self.lba() - GPT_ENTRIES_SECTORS {
                    return false;
                }
            }
        }

        // The usable range must sit strictly between the primary entry table
        // and the secondary entry table.
        if self.first_usable_lba() < 2 + GPT_ENTRIES_SECTORS {
            return false;
        }
        if self.last_usable_lba() >= drive_sectors - 1 - GPT_ENTRIES_SECTORS {
            return false;
        }
        if self.first_usable_lba() > self.last_usable_lba() {
            return false;
        }

        true
    }

    /// Checks whether another header describes the same table as this one.
    ///
    /// The two on-disk copies are expected to agree on everything except the
    /// fields tied to their own location (`lba`, `alternate_lba`,
    /// `partition_start_lba`) and, consequently, the header checksum; those
    /// are excluded from the comparison.
    #[must_use]
    pub fn fields_match(&self, other: &GptHeader) -> bool {
        self.signature() == other.signature()
            && self.revision() == other.revision()
            && self.size() == other.size()
            && self.reserved() == other.reserved()
            && self.first_usable_lba() == other.first_usable_lba()
            && self.last_usable_lba() == other.last_usable_lba()
            && self.guid() == other.guid()
            && self.partition_entries_count() == other.partition_entries_count()
            && self.partition_entry_size() == other.partition_entry_size()
            && self.partition_entries_checksum() == other.partition_entries_checksum()
    }

    /// Disk GUID as a [`uuid::Uuid`], decoding the on-disk mixed-endian
    /// layout.
    #[cfg(feature = "std")]
    #[cfg_attr(docsrs, doc(cfg(feature = "std")))]
    #[must_use]
    pub fn disk_uuid(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes_le(self.guid().to_le_bytes())
    }

    packed_field_accessors!(signature, set_signature, [u8; 8]);
    packed_field_accessors!(revision, set_revision, u32);
    packed_field_accessors!(size, set_size, u32);
    packed_field_accessors!(checksum, set_checksum, u32);
    packed_field_accessors!(reserved, [u8; 4]);
    packed_field_accessors!(lba, set_lba, u64);
    packed_field_accessors!(alternate_lba, set_alternate_lba, u64);
    packed_field_accessors!(first_usable_lba, set_first_usable_lba, u64);
    packed_field_accessors!(last_usable_lba, set_last_usable_lba, u64);
    packed_field_accessors!(guid, set_guid, u128);
    packed_field_accessors!(partition_start_lba, set_partition_start_lba, u64);
    packed_field_accessors!(partition_entries_count, set_partition_entries_count, u32);
    packed_field_accessors!(partition_entry_size, set_partition_entry_size, u32);
    packed_field_accessors!(
        partition_entries_checksum,
        set_partition_entries_checksum,
        u32
    );
}

/// A single entry of the partition table.
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed(1))]
pub struct GptPartition {
    /// Defines the purpose and type of this partition. All-zero marks the
    /// slot unused.
    type_guid: u128,

    /// GUID unique for every partition entry.
    partition_guid: u128,

    /// First LBA of this partition.
    start_lba: u64,

    /// Last LBA of this partition (inclusive).
    last_lba: u64,

    /// Partition's attribute bits.
    attributes: u64,

    /// Null-terminated UTF-16 human-readable name of this partition.
    partition_name: [u16; 36],
}

assert_eq_size!(GptPartition, [u8; GPT_ENTRY_SIZE]);
assert_eq_align!(GptPartition, u8);

impl GptPartition {
    /// Returns `true` if this slot holds a partition.
    #[must_use]
    pub fn is_used(&self) -> bool {
        self.type_guid() != 0
    }

    /// Returns `true` if this entry is a bootable kernel partition.
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.type_guid() == KERNEL_TYPE_GUID
    }

    /// Returns this partition's size in sectors.
    ///
    /// The block range is inclusive on both ends; meaningful only for used
    /// entries.
    #[must_use]
    pub fn sectors_count(&self) -> u64 {
        self.last_lba() - self.start_lba() + 1
    }

    /// Returns `true` if the legacy-BIOS-bootable flag is set.
    #[must_use]
    pub fn is_legacy_bootable(&self) -> bool {
        self.attributes() & ATTR_LEGACY_BOOTABLE != 0
    }

    /// Sets or clears the legacy-BIOS-bootable flag.
    pub fn set_legacy_bootable(&mut self, bootable: bool) {
        let attributes = if bootable {
            self.attributes() | ATTR_LEGACY_BOOTABLE
        } else {
            self.attributes() & !ATTR_LEGACY_BOOTABLE
        };
        self.set_attributes(attributes);
    }

    /// Returns `true` if this kernel entry has booted successfully before.
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.attributes() & ATTR_SUCCESSFUL_MASK != 0
    }

    /// Marks this kernel entry as having booted successfully (or not).
    pub fn set_successful(&mut self, successful: bool) {
        let attributes = if successful {
            self.attributes() | ATTR_SUCCESSFUL_MASK
        } else {
            self.attributes() & !ATTR_SUCCESSFUL_MASK
        };
        self.set_attributes(attributes);
    }

    /// Boot priority of this kernel entry (0 = never boot, 15 = highest).
    ///
    /// # Examples
    ///
    /// ```
    /// use dualgpt::GptPartition;
    ///
    /// let mut part = GptPartition::default();
    /// part.set_priority(8);
    ///
    /// assert_eq!(part.priority(), 8);
    /// assert!(!part.is_successful());
    /// ```
    #[must_use]
    pub fn priority(&self) -> u8 {
        ((self.attributes() & ATTR_PRIORITY_MASK) >> ATTR_PRIORITY_SHIFT) as u8
    }

    /// Sets this kernel entry's boot priority. Values above 15 are truncated
    /// to the 4-bit field.
    pub fn set_priority(&mut self, priority: u8) {
        let attributes = (self.attributes() & !ATTR_PRIORITY_MASK)
            | (((priority as u64) << ATTR_PRIORITY_SHIFT) & ATTR_PRIORITY_MASK);
        self.set_attributes(attributes);
    }

    /// Remaining boot attempts for this kernel entry.
    #[must_use]
    pub fn tries_remaining(&self) -> u8 {
        ((self.attributes() & ATTR_TRIES_MASK) >> ATTR_TRIES_SHIFT) as u8
    }

    /// Sets the remaining boot attempts. Values above 15 are truncated to the
    /// 4-bit field.
    pub fn set_tries_remaining(&mut self, tries: u8) {
        let attributes = (self.attributes() & !ATTR_TRIES_MASK)
            | (((tries as u64) << ATTR_TRIES_SHIFT) & ATTR_TRIES_MASK);
        self.set_attributes(attributes);
    }

    /// Decodes this partition's UTF-16 name.
    #[cfg(feature = "alloc")]
    #[cfg_attr(docsrs, doc(cfg(feature = "alloc")))]
    pub fn name(&self) -> Result<String, GptError> {
        let name_buf = unsafe { read_unaligned(addr_of!(self.partition_name)) };
        let filtered_buf: Vec<u16> = name_buf.into_iter().take_while(|&c| c != 0).collect();

        String::from_utf16(&filtered_buf).map_err(|_| GptError::InvalidEntries)
    }

    /// Unique partition GUID as a [`uuid::Uuid`], decoding the on-disk
    /// mixed-endian layout.
    #[cfg(feature = "std")]
    #[cfg_attr(docsrs, doc(cfg(feature = "std")))]
    #[must_use]
    pub fn unique_uuid(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes_le(self.partition_guid().to_le_bytes())
    }

    packed_field_accessors!(type_guid, set_type_guid, u128);
    packed_field_accessors!(partition_guid, set_partition_guid, u128);
    packed_field_accessors!(start_lba, set_start_lba, u64);
    packed_field_accessors!(last_lba, set_last_lba, u64);
    packed_field_accessors!(attributes, set_attributes, u64);
}

impl Default for GptPartition {
    fn default() -> Self {
        Self {
            type_guid: 0,
            partition_guid: 0,
            start_lba: 0,
            last_lba: 0,
            attributes: 0,
            partition_name: [0u16; 36],
        }
    }
}

/// Validates one full entry table against a trusted header.
///
/// The header supplies the entry count, record size, checksum claim and
/// usable block bounds. It may deliberately belong to the *other* copy: that
/// is what lets a caller detect the case where each (header, entries) pair is
/// internally consistent but the two copies disagree.
///
/// Checks run in a fixed order and the first failure wins: the table checksum
/// ([`GptError::EntriesCrcCorrupted`]), then for every used entry its
/// containment in the usable range ([`GptError::EntryOutOfRegion`]) and
/// pairwise conflicts with every other used entry
/// ([`GptError::StartLbaOverlap`], [`GptError::EndLbaOverlap`],
/// [`GptError::DuplicateGuid`]). The pairwise pass is quadratic; entry counts
/// are bounded by the fixed table size, so this stays cheap.
pub fn check_entries(
    entries: &[u8; TOTAL_ENTRIES_SIZE],
    header: &GptHeader,
) -> Result<(), GptError> {
    let count = header.partition_entries_count() as usize;
    if header.partition_entry_size() as usize != GPT_ENTRY_SIZE
        || count == 0
        || count > MAX_ENTRIES as usize
    {
        return Err(GptError::InvalidEntries);
    }

    // Checksum before examining individual entries.
    let span = GPT_ENTRY_SIZE * count;
    if crc32fast::hash(&entries[..span]) != header.partition_entries_checksum() {
        return Err(GptError::EntriesCrcCorrupted);
    }

    let table: &[GptPartition; MAX_ENTRIES as usize] = transmute_ref!(entries);
    let table = &table[..count];

    for (idx, entry) in table.iter().enumerate() {
        if !entry.is_used() {
            continue;
        }

        if entry.start_lba() < header.first_usable_lba()
            || entry.last_lba() > header.last_usable_lba()
            || entry.last_lba() < entry.start_lba()
        {
            return Err(GptError::EntryOutOfRegion);
        }

        for (other_idx, other) in table.iter().enumerate() {
            if other_idx == idx || !other.is_used() {
                continue;
            }

            if entry.start_lba() >= other.start_lba() && entry.start_lba() <= other.last_lba() {
                return Err(GptError::StartLbaOverlap);
            }
            if entry.last_lba() >= other.start_lba() && entry.last_lba() <= other.last_lba() {
                return Err(GptError::EndLbaOverlap);
            }
            if entry.partition_guid() == other.partition_guid() {
                return Err(GptError::DuplicateGuid);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    const DRIVE_SECTORS: u64 = 1024;
    const DISK_GUID: u128 = 0x0123_4567_89ab_cdef_fedc_ba98_7654_3210;

    fn build_header(copy: GptCopy, drive_sectors: u64, entries_checksum: u32) -> [u8; SECTOR_SIZE] {
        let mut sector = [0u8; SECTOR_SIZE];
        let header = GptHeader::from_sector_mut(&mut sector);

        header.set_signature(*GPT_SIGNATURE);
        header.set_revision(GPT_REVISION);
        header.set_size(MIN_HEADER_SIZE);

        let (lba, alternate_lba, entries_lba) = match copy {
            GptCopy::Primary => (1, drive_sectors - 1, 2),
            GptCopy::Secondary => (
                drive_sectors - 1,
                1,
                drive_sectors - 1 - GPT_ENTRIES_SECTORS,
            ),
        };
        header.set_lba(lba);
        header.set_alternate_lba(alternate_lba);
        header.set_partition_start_lba(entries_lba);

        header.set_first_usable_lba(2 + GPT_ENTRIES_SECTORS);
        header.set_last_usable_lba(drive_sectors - GPT_ENTRIES_SECTORS - 2);
        header.set_guid(DISK_GUID);
        header.set_partition_entries_count(MAX_ENTRIES);
        header.set_partition_entry_size(GPT_ENTRY_SIZE as u32);
        header.set_partition_entries_checksum(entries_checksum);
        header.update_checksum();

        sector
    }

    fn build_entries(specs: &[(u128, u128, u64, u64)]) -> [u8; TOTAL_ENTRIES_SIZE] {
        let mut buf = [0u8; TOTAL_ENTRIES_SIZE];
        let table: &mut [GptPartition; MAX_ENTRIES as usize] = transmute_mut!(&mut buf);

        for (slot, &(type_guid, unique_guid, start, last)) in specs.iter().enumerate() {
            table[slot].set_type_guid(type_guid);
            table[slot].set_partition_guid(unique_guid);
            table[slot].set_start_lba(start);
            table[slot].set_last_lba(last);
        }

        buf
    }

    fn entries_with_checksum(
        specs: &[(u128, u128, u64, u64)],
    ) -> ([u8; TOTAL_ENTRIES_SIZE], u32) {
        let entries = build_entries(specs);
        let checksum = crc32fast::hash(&entries);
        (entries, checksum)
    }

    #[test]
    fn pristine_header_validates() {
        let sector = build_header(GptCopy::Primary, DRIVE_SECTORS, 0);
        assert!(GptHeader::from_sector(&sector).is_valid(GptCopy::Primary, DRIVE_SECTORS));

        let sector = build_header(GptCopy::Secondary, DRIVE_SECTORS, 0);
        assert!(GptHeader::from_sector(&sector).is_valid(GptCopy::Secondary, DRIVE_SECTORS));
    }

    #[test]
    fn alternate_signature_accepted() {
        let mut sector = build_header(GptCopy::Primary, DRIVE_SECTORS, 0);
        let header = GptHeader::from_sector_mut(&mut sector);
        header.set_signature(*GPT_SIGNATURE_ALT);
        header.update_checksum();

        assert!(header.is_valid(GptCopy::Primary, DRIVE_SECTORS));
    }

    #[test]
    fn checksum_detects_any_flip() {
        let mut sector = build_header(GptCopy::Primary, DRIVE_SECTORS, 0);

        // Flip a byte inside the disk GUID; the stored checksum no longer
        // matches.
        sector[60] ^= 0x01;
        assert!(!GptHeader::from_sector(&sector).is_valid(GptCopy::Primary, DRIVE_SECTORS));

        sector[60] ^= 0x01;
        assert!(GptHeader::from_sector(&sector).is_valid(GptCopy::Primary, DRIVE_SECTORS));
    }

    #[test]
    fn structural_field_corruption_rejected() {
        let mut sector = build_header(GptCopy::Primary, DRIVE_SECTORS, 0);
        {
            let header = GptHeader::from_sector_mut(&mut sector);
            header.set_revision(0x0002_0000);
            header.update_checksum();
            assert!(!header.is_valid(GptCopy::Primary, DRIVE_SECTORS));
        }

        let mut sector = build_header(GptCopy::Primary, DRIVE_SECTORS, 0);
        {
            let header = GptHeader::from_sector_mut(&mut sector);
            header.set_size(MIN_HEADER_SIZE - 1);
            header.update_checksum();
            assert!(!header.is_valid(GptCopy::Primary, DRIVE_SECTORS));
        }

        // Reserved field must be zero even under a fresh checksum.
        let mut sector = build_header(GptCopy::Primary, DRIVE_SECTORS, 0);
        sector[20] = 0xAA;
        {
            let header = GptHeader::from_sector_mut(&mut sector);
            header.update_checksum();
            assert!(!header.is_valid(GptCopy::Primary, DRIVE_SECTORS));
        }

        let mut sector = build_header(GptCopy::Primary, DRIVE_SECTORS, 0);
        {
            let header = GptHeader::from_sector_mut(&mut sector);
            header.set_partition_entries_count(64);
            header.update_checksum();
            assert!(!header.is_valid(GptCopy::Primary, DRIVE_SECTORS));
        }
    }

    #[test]
    fn role_location_enforced() {
        // A primary header does not validate in the secondary role and vice
        // versa.
        let primary = build_header(GptCopy::Primary, DRIVE_SECTORS, 0);
        assert!(!GptHeader::from_sector(&primary).is_valid(GptCopy::Secondary, DRIVE_SECTORS));

        let secondary = build_header(GptCopy::Secondary, DRIVE_SECTORS, 0);
        assert!(!GptHeader::from_sector(&secondary).is_valid(GptCopy::Primary, DRIVE_SECTORS));
    }

    #[test]
    fn usable_range_enforced() {
        let mut sector = build_header(GptCopy::Primary, DRIVE_SECTORS, 0);
        let header = GptHeader::from_sector_mut(&mut sector);

        header.set_first_usable_lba(header.last_usable_lba() + 1);
        header.update_checksum();
        assert!(!header.is_valid(GptCopy::Primary, DRIVE_SECTORS));

        header.set_first_usable_lba(GPT_ENTRIES_SECTORS + 1);
        header.update_checksum();
        assert!(!header.is_valid(GptCopy::Primary, DRIVE_SECTORS));

        header.set_first_usable_lba(2 + GPT_ENTRIES_SECTORS);
        header.set_last_usable_lba(DRIVE_SECTORS - 1 - GPT_ENTRIES_SECTORS);
        header.update_checksum();
        assert!(!header.is_valid(GptCopy::Primary, DRIVE_SECTORS));
    }

    #[test]
    fn undersized_drive_never_validates() {
        let sector = build_header(GptCopy::Primary, DRIVE_SECTORS, 0);
        assert!(!GptHeader::from_sector(&sector).is_valid(GptCopy::Primary, 10));
    }

    #[test]
    fn fields_match_ignores_location_fields() {
        let (_, checksum) = entries_with_checksum(&[(1, 2, 100, 199)]);
        let primary = build_header(GptCopy::Primary, DRIVE_SECTORS, checksum);
        let secondary = build_header(GptCopy::Secondary, DRIVE_SECTORS, checksum);

        // The two roles differ in lba / alternate_lba / partition_start_lba
        // and checksum, and still match.
        assert!(GptHeader::from_sector(&primary).fields_match(GptHeader::from_sector(&secondary)));
    }

    #[test]
    fn fields_match_detects_shared_field_divergence() {
        let mut primary = build_header(GptCopy::Primary, DRIVE_SECTORS, 0);
        let secondary = build_header(GptCopy::Secondary, DRIVE_SECTORS, 0);

        let header = GptHeader::from_sector_mut(&mut primary);
        header.set_guid(DISK_GUID ^ 1);
        header.update_checksum();

        assert!(!header.fields_match(GptHeader::from_sector(&secondary)));
    }

    #[test]
    fn valid_entries_pass() {
        let (entries, checksum) = entries_with_checksum(&[
            (KERNEL_TYPE_GUID, 0xaa, 34, 133),
            (0xdead_beef, 0xbb, 200, 299),
        ]);
        let sector = build_header(GptCopy::Primary, DRIVE_SECTORS, checksum);

        check_entries(&entries, GptHeader::from_sector(&sector)).unwrap();
    }

    #[test]
    fn entries_checksum_mismatch_reported_first() {
        let (mut entries, checksum) = entries_with_checksum(&[(KERNEL_TYPE_GUID, 0xaa, 34, 133)]);
        let sector = build_header(GptCopy::Primary, DRIVE_SECTORS, checksum);

        entries[0] ^= 0xFF;
        assert_eq!(
            check_entries(&entries, GptHeader::from_sector(&sector)),
            Err(GptError::EntriesCrcCorrupted)
        );
    }

    #[test]
    fn entry_outside_usable_range() {
        // Last usable LBA for this geometry is 990.
        let (entries, checksum) = entries_with_checksum(&[(1, 0xaa, 900, 991)]);
        let sector = build_header(GptCopy::Primary, DRIVE_SECTORS, checksum);

        assert_eq!(
            check_entries(&entries, GptHeader::from_sector(&sector)),
            Err(GptError::EntryOutOfRegion)
        );

        // Inverted range.
        let (entries, checksum) = entries_with_checksum(&[(1, 0xaa, 300, 200)]);
        let sector = build_header(GptCopy::Primary, DRIVE_SECTORS, checksum);

        assert_eq!(
            check_entries(&entries, GptHeader::from_sector(&sector)),
            Err(GptError::EntryOutOfRegion)
        );
    }

    #[test]
    fn identical_start_is_a_start_overlap() {
        // Same starting LBA and colliding GUIDs: the start overlap is the
        // first conflict found for the pair and must be the one reported.
        let (entries, checksum) =
            entries_with_checksum(&[(1, 0xaa, 100, 199), (2, 0xaa, 100, 299)]);
        let sector = build_header(GptCopy::Primary, DRIVE_SECTORS, checksum);

        assert_eq!(
            check_entries(&entries, GptHeader::from_sector(&sector)),
            Err(GptError::StartLbaOverlap)
        );
    }

    #[test]
    fn trailing_range_collision_is_an_end_overlap() {
        let (entries, checksum) =
            entries_with_checksum(&[(1, 0xaa, 100, 300), (2, 0xbb, 200, 400)]);
        let sector = build_header(GptCopy::Primary, DRIVE_SECTORS, checksum);

        assert_eq!(
            check_entries(&entries, GptHeader::from_sector(&sector)),
            Err(GptError::EndLbaOverlap)
        );
    }

    #[test]
    fn duplicate_unique_guid_detected() {
        let (entries, checksum) =
            entries_with_checksum(&[(1, 0xaa, 100, 199), (2, 0xaa, 300, 399)]);
        let sector = build_header(GptCopy::Primary, DRIVE_SECTORS, checksum);

        assert_eq!(
            check_entries(&entries, GptHeader::from_sector(&sector)),
            Err(GptError::DuplicateGuid)
        );
    }

    #[test]
    fn unused_entries_are_exempt() {
        // Slot with an all-zero type GUID carries garbage bounds and a
        // colliding GUID; none of it counts.
        let (entries, checksum) =
            entries_with_checksum(&[(1, 0xaa, 100, 199), (0, 0xaa, 5000, 4000)]);
        let sector = build_header(GptCopy::Primary, DRIVE_SECTORS, checksum);

        check_entries(&entries, GptHeader::from_sector(&sector)).unwrap();
    }

    #[test]
    fn attribute_bit_layout() {
        let mut part = GptPartition::default();

        part.set_priority(0xF);
        assert_eq!(part.attributes(), 0xF << 48);

        part.set_priority(0);
        part.set_tries_remaining(0xF);
        assert_eq!(part.attributes(), 0xF << 52);

        part.set_tries_remaining(0);
        part.set_successful(true);
        assert_eq!(part.attributes(), 1 << 56);

        part.set_successful(false);
        part.set_legacy_bootable(true);
        assert_eq!(part.attributes(), 1 << 2);

        part.set_legacy_bootable(false);
        assert_eq!(part.attributes(), 0);
    }

    #[test]
    fn attribute_accessors_roundtrip() {
        let mut part = GptPartition::default();

        part.set_priority(9);
        part.set_tries_remaining(3);
        part.set_successful(true);
        part.set_legacy_bootable(true);

        assert_eq!(part.priority(), 9);
        assert_eq!(part.tries_remaining(), 3);
        assert!(part.is_successful());
        assert!(part.is_legacy_bootable());

        // Oversized values are truncated to their 4-bit fields and do not
        // leak into neighbouring bits.
        part.set_priority(0xFF);
        assert_eq!(part.priority(), 0xF);
        assert_eq!(part.tries_remaining(), 3);
    }

    #[test]
    fn kernel_type_detection() {
        let mut part = GptPartition::default();
        assert!(!part.is_kernel());
        assert!(!part.is_used());

        part.set_type_guid(KERNEL_TYPE_GUID);
        assert!(part.is_kernel());
        assert!(part.is_used());
    }

    #[test]
    fn sectors_count_is_inclusive() {
        let mut part = GptPartition::default();
        part.set_start_lba(34);
        part.set_last_lba(133);

        assert_eq!(part.sectors_count(), 100);
    }

    #[cfg(feature = "alloc")]
    #[test]
    fn partition_name_decodes() {
        let mut raw = [0u8; GPT_ENTRY_SIZE];
        raw[0] = 1; // mark the slot used

        for (i, c) in "KERN-A".encode_utf16().enumerate() {
            raw[56 + 2 * i..56 + 2 * i + 2].copy_from_slice(&c.to_le_bytes());
        }

        let part: &GptPartition = transmute_ref!(&raw);
        assert_eq!(part.name().unwrap(), "KERN-A");
    }

    #[test]
    fn error_text_is_stable() {
        assert_eq!(
            GptError::EntriesCrcCorrupted.description(),
            "entries crc corrupted"
        );
        assert_eq!(GptError::StartLbaOverlap.description(), "starting lba overlaps");
    }
}
