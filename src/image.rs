//! In-memory working set for the two on-disk metadata copies.
//!
//! [`GptImage`] owns the four raw regions a caller reads off the drive (both
//! header sectors and both entry tables) together with the drive geometry,
//! and layers the trust machinery on top: [`GptImage::sanity_check`] decides
//! which copies can be believed, [`GptImage::repair`] rebuilds a damaged copy
//! from the surviving one, and [`GptImage::commit_primary_changes`] reseals
//! and mirrors caller edits to the primary table.
//!
//! Nothing here touches the device. Repairs only rewrite the owned buffers
//! and record which regions diverged from the drive in a modified-region set;
//! flushing those regions back (and clearing the set afterwards) is the
//! caller's job.

use zerocopy::{transmute_mut, transmute_ref};

use crate::gpt::{
    check_entries, GptCopy, GptError, GptHeader, GptPartition, GPT_ENTRIES_SECTORS, MAX_ENTRIES,
    MIN_DRIVE_SECTORS, SECTOR_SIZE, TOTAL_ENTRIES_SIZE,
};

/// Which of the two redundant copies currently hold, per the last sanity
/// pass.
///
/// Headers and entry tables are tracked independently: a drive can have two
/// good headers and one shredded entry table, or the other way around.
///
/// # Examples
///
/// ```
/// use dualgpt::{GptCopy, Validity};
///
/// let validity = Validity::Neither.with(GptCopy::Primary);
///
/// assert!(validity.contains(GptCopy::Primary));
/// assert_eq!(validity.with(GptCopy::Secondary), Validity::Both);
/// assert_eq!(Validity::Both.without(GptCopy::Primary), Validity::SecondaryOnly);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Validity {
    /// Neither copy can be trusted.
    #[default]
    Neither,

    /// Only the primary copy holds.
    PrimaryOnly,

    /// Only the secondary copy holds.
    SecondaryOnly,

    /// Both copies hold.
    Both,
}

impl Validity {
    /// The set containing exactly `copy`.
    #[must_use]
    pub fn only(copy: GptCopy) -> Self {
        Validity::Neither.with(copy)
    }

    /// This set with `copy` added.
    #[must_use]
    pub fn with(self, copy: GptCopy) -> Self {
        match (self, copy) {
            (Validity::Neither, GptCopy::Primary) => Validity::PrimaryOnly,
            (Validity::Neither, GptCopy::Secondary) => Validity::SecondaryOnly,
            (Validity::PrimaryOnly, GptCopy::Secondary)
            | (Validity::SecondaryOnly, GptCopy::Primary) => Validity::Both,
            (current, _) => current,
        }
    }

    /// This set with `copy` removed.
    #[must_use]
    pub fn without(self, copy: GptCopy) -> Self {
        match (self, copy) {
            (Validity::PrimaryOnly, GptCopy::Primary)
            | (Validity::SecondaryOnly, GptCopy::Secondary) => Validity::Neither,
            (Validity::Both, GptCopy::Primary) => Validity::SecondaryOnly,
            (Validity::Both, GptCopy::Secondary) => Validity::PrimaryOnly,
            (current, _) => current,
        }
    }

    /// Returns `true` if `copy` is in the set.
    #[must_use]
    pub fn contains(self, copy: GptCopy) -> bool {
        match copy {
            GptCopy::Primary => matches!(self, Validity::PrimaryOnly | Validity::Both),
            GptCopy::Secondary => matches!(self, Validity::SecondaryOnly | Validity::Both),
        }
    }

    /// Returns `true` if the set is empty.
    #[must_use]
    pub fn is_neither(self) -> bool {
        self == Validity::Neither
    }
}

/// One of the four raw on-disk regions backing a [`GptImage`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GptRegion {
    /// Sector 1.
    PrimaryHeader = 0,

    /// The 32 sectors following the primary header.
    PrimaryEntries = 1,

    /// The last sector of the drive.
    SecondaryHeader = 2,

    /// The 32 sectors preceding the secondary header.
    SecondaryEntries = 3,
}

/// Set of regions whose in-memory bytes diverged from the drive.
///
/// Repair operations insert into the set; it accumulates across calls until
/// the caller flushes the named regions and clears it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModifiedRegions(u8);

impl ModifiedRegions {
    pub(crate) fn insert(&mut self, region: GptRegion) {
        self.0 |= 1 << region as u8;
    }

    /// Returns `true` if `region` must be written back to the drive.
    #[must_use]
    pub fn contains(self, region: GptRegion) -> bool {
        self.0 & (1 << region as u8) != 0
    }

    /// Returns `true` if no region needs writing back.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Empties the set. Call after flushing every contained region.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// The full in-memory state of a drive's partition metadata.
///
/// Owns both header sectors and both entry tables, exactly as read off the
/// drive, plus the derived trust state. A freshly constructed image carries
/// no verdict: [`GptImage::sanity_check`] must run before the validity masks
/// mean anything, and it recomputes them from scratch on every call.
pub struct GptImage {
    primary_header: [u8; SECTOR_SIZE],
    secondary_header: [u8; SECTOR_SIZE],
    primary_entries: [u8; TOTAL_ENTRIES_SIZE],
    secondary_entries: [u8; TOTAL_ENTRIES_SIZE],

    drive_sectors: u64,
    sector_bytes: u32,

    valid_headers: Validity,
    valid_entries: Validity,
    modified: ModifiedRegions,

    current_kernel: Option<u32>,
}

impl GptImage {
    /// Builds an image from the four freshly-read regions and the drive
    /// geometry.
    ///
    /// The regions are copied; the image owns its bytes for the whole
    /// validation/repair cycle. No validation happens here.
    #[must_use]
    pub fn from_regions(
        primary_header: &[u8; SECTOR_SIZE],
        primary_entries: &[u8; TOTAL_ENTRIES_SIZE],
        secondary_header: &[u8; SECTOR_SIZE],
        secondary_entries: &[u8; TOTAL_ENTRIES_SIZE],
        drive_sectors: u64,
        sector_bytes: u32,
    ) -> Self {
        GptImage {
            primary_header: *primary_header,
            secondary_header: *secondary_header,
            primary_entries: *primary_entries,
            secondary_entries: *secondary_entries,
            drive_sectors,
            sector_bytes,
            valid_headers: Validity::Neither,
            valid_entries: Validity::Neither,
            modified: ModifiedRegions::default(),
            current_kernel: None,
        }
    }

    /// Total number of sectors on the drive.
    #[must_use]
    pub fn drive_sectors(&self) -> u64 {
        self.drive_sectors
    }

    /// Header validity mask from the last sanity pass.
    #[must_use]
    pub fn valid_headers(&self) -> Validity {
        self.valid_headers
    }

    /// Entry-table validity mask from the last sanity pass.
    #[must_use]
    pub fn valid_entries(&self) -> Validity {
        self.valid_entries
    }

    /// Regions that must be written back to the drive.
    #[must_use]
    pub fn modified_regions(&self) -> ModifiedRegions {
        self.modified
    }

    /// Empties the modified-region set. Call after flushing.
    pub fn clear_modified(&mut self) {
        self.modified.clear();
    }

    /// Index of the currently selected kernel entry, if any.
    #[must_use]
    pub fn current_kernel(&self) -> Option<u32> {
        self.current_kernel
    }

    /// Records which primary-table entry is the kernel being booted.
    pub fn set_current_kernel(&mut self, index: Option<u32>) {
        self.current_kernel = index;
    }

    /// Unique GUID of the currently selected kernel entry.
    pub fn kernel_unique_guid(&self) -> Result<u128, GptError> {
        let index = self.current_kernel.ok_or(GptError::NoSuchEntry)? as usize;
        let entry = self
            .entries(GptCopy::Primary)
            .get(index)
            .ok_or(GptError::NoSuchEntry)?;

        Ok(entry.partition_guid())
    }

    /// Borrows one header copy.
    #[must_use]
    pub fn header(&self, copy: GptCopy) -> &GptHeader {
        match copy {
            GptCopy::Primary => GptHeader::from_sector(&self.primary_header),
            GptCopy::Secondary => GptHeader::from_sector(&self.secondary_header),
        }
    }

    /// Borrows one copy's full entry table, used and unused slots alike.
    #[must_use]
    pub fn entries(&self, copy: GptCopy) -> &[GptPartition] {
        let table: &[GptPartition; MAX_ENTRIES as usize] = match copy {
            GptCopy::Primary => transmute_ref!(&self.primary_entries),
            GptCopy::Secondary => transmute_ref!(&self.secondary_entries),
        };

        table
    }

    /// Iterates over one copy's used partitions.
    pub fn iter_partitions(&self, copy: GptCopy) -> impl Iterator<Item = &GptPartition> {
        self.entries(copy).iter().filter(|part| part.is_used())
    }

    /// Mutably borrows one entry of the primary table.
    ///
    /// This is the edit entry point for callers adjusting boot attributes:
    /// mutate through the returned reference, then seal and mirror the change
    /// with [`GptImage::commit_primary_changes`].
    pub fn entry_mut(&mut self, index: usize) -> Result<&mut GptPartition, GptError> {
        let count = self
            .header(GptCopy::Primary)
            .partition_entries_count()
            .min(MAX_ENTRIES) as usize;
        if index >= count {
            return Err(GptError::NoSuchEntry);
        }

        let table: &mut [GptPartition; MAX_ENTRIES as usize] =
            transmute_mut!(&mut self.primary_entries);
        Ok(&mut table[index])
    }

    /// Borrows a region's raw bytes, for flushing back to the drive.
    #[must_use]
    pub fn region_bytes(&self, region: GptRegion) -> &[u8] {
        match region {
            GptRegion::PrimaryHeader => &self.primary_header,
            GptRegion::PrimaryEntries => &self.primary_entries,
            GptRegion::SecondaryHeader => &self.secondary_header,
            GptRegion::SecondaryEntries => &self.secondary_entries,
        }
    }

    fn header_sector_mut(&mut self, copy: GptCopy) -> &mut GptHeader {
        match copy {
            GptCopy::Primary => GptHeader::from_sector_mut(&mut self.primary_header),
            GptCopy::Secondary => GptHeader::from_sector_mut(&mut self.secondary_header),
        }
    }

    /// Byte span of one entry table as claimed by a header. A structurally
    /// valid header pins this at the fixed table size; the clamp keeps an
    /// unchecked header from indexing past the buffers.
    fn entries_span(header: &GptHeader) -> usize {
        let span =
            header.partition_entry_size() as usize * header.partition_entries_count() as usize;
        span.min(TOTAL_ENTRIES_SIZE)
    }

    fn check_parameters(&self) -> Result<(), GptError> {
        if self.sector_bytes as usize != SECTOR_SIZE {
            return Err(GptError::InvalidSectorSize);
        }

        // A drive too small for a protective MBR plus both metadata copies
        // cannot be a GPT drive; its header bytes are not worth inspecting.
        if self.drive_sectors < MIN_DRIVE_SECTORS {
            return Err(GptError::InvalidSectorCount);
        }

        Ok(())
    }

    /// Runs the full trust decision over both copies.
    ///
    /// Recomputes both validity masks from scratch:
    ///
    /// 1. Geometry parameters are checked first; a bad sector size or count
    ///    is fatal before any header byte is read.
    /// 2. Each header is validated for its own role. At least one must hold,
    ///    and the primary is preferred as the reference ("good") header when
    ///    both do.
    /// 3. Both entry tables are validated against that same good header,
    ///    deliberately not each against its own. This is what catches two
    ///    self-consistent copies that disagree with each other.
    /// 4. If both headers hold but neither table matched the good header's
    ///    claim, both tables are retried against the secondary header. Any
    ///    success there means the primary header's table claim was the stale
    ///    one, and the primary is demoted.
    /// 5. With the table verdict settled, two valid headers must also agree
    ///    on every shared field; if they disagree, the secondary is demoted
    ///    and the primary wins the tie.
    ///
    /// Never mutates the raw regions. The masks are left populated even on
    /// failure, for diagnostics.
    pub fn sanity_check(&mut self) -> Result<(), GptError> {
        self.valid_headers = Validity::Neither;
        self.valid_entries = Validity::Neither;

        self.check_parameters()?;

        if self
            .header(GptCopy::Primary)
            .is_valid(GptCopy::Primary, self.drive_sectors)
        {
            self.valid_headers = self.valid_headers.with(GptCopy::Primary);
        }
        if self
            .header(GptCopy::Secondary)
            .is_valid(GptCopy::Secondary, self.drive_sectors)
        {
            self.valid_headers = self.valid_headers.with(GptCopy::Secondary);
        }

        if self.valid_headers.is_neither() {
            return Err(GptError::InvalidHeaders);
        }

        let good = if self.valid_headers.contains(GptCopy::Primary) {
            GptCopy::Primary
        } else {
            GptCopy::Secondary
        };

        if check_entries(&self.primary_entries, self.header(good)).is_ok() {
            self.valid_entries = self.valid_entries.with(GptCopy::Primary);
        }
        if check_entries(&self.secondary_entries, self.header(good)).is_ok() {
            self.valid_entries = self.valid_entries.with(GptCopy::Secondary);
        }

        if self.valid_headers == Validity::Both && self.valid_entries.is_neither() {
            if check_entries(&self.primary_entries, self.header(GptCopy::Secondary)).is_ok() {
                self.valid_entries = self.valid_entries.with(GptCopy::Primary);
            }
            if check_entries(&self.secondary_entries, self.header(GptCopy::Secondary)).is_ok() {
                self.valid_entries = self.valid_entries.with(GptCopy::Secondary);
            }

            // The secondary header held the right claim for a table after
            // all, so the primary's claim was the corrupt part. Demote it so
            // repair reseals its table checksum.
            if !self.valid_entries.is_neither() {
                self.valid_headers = self.valid_headers.without(GptCopy::Primary);
            }
        }

        if self.valid_entries.is_neither() {
            return Err(GptError::InvalidEntries);
        }

        if self.valid_headers == Validity::Both
            && !self
                .header(GptCopy::Primary)
                .fields_match(self.header(GptCopy::Secondary))
        {
            self.valid_headers = self.valid_headers.without(GptCopy::Secondary);
        }

        Ok(())
    }

    /// Reconciles the preferred header with the drive's actual size.
    ///
    /// Metadata copied between differently-sized media still carries the old
    /// drive's secondary location and usable bound. This recomputes where the
    /// secondary copy belongs on *this* drive and patches the preferred valid
    /// header when it is stale, under an all-or-nothing discipline: the
    /// header sector is snapshotted, patched and re-checked with a full
    /// sanity pass, and restored byte-for-byte (with another sanity pass to
    /// re-establish the previous verdict) if the patched header fails or the
    /// set of valid headers shifted in a way the patch cannot explain.
    fn recompute_geometry(&mut self) -> Result<(), GptError> {
        let alt_lba = self.drive_sectors - 1;
        let alt_entries_lba = alt_lba - GPT_ENTRIES_SECTORS;
        let last_usable_lba = alt_entries_lba - 1;

        let patched = if self.valid_headers.contains(GptCopy::Primary) {
            let header = self.header(GptCopy::Primary);
            if header.alternate_lba() == alt_lba && header.last_usable_lba() == last_usable_lba {
                return Ok(());
            }

            let snapshot = self.primary_header;
            let header = self.header_sector_mut(GptCopy::Primary);
            header.set_alternate_lba(alt_lba);
            header.set_last_usable_lba(last_usable_lba);
            header.update_checksum();

            (GptCopy::Primary, snapshot)
        } else if self.valid_headers.contains(GptCopy::Secondary) {
            let header = self.header(GptCopy::Secondary);
            if header.lba() == alt_lba
                && header.partition_start_lba() == alt_entries_lba
                && header.last_usable_lba() == last_usable_lba
            {
                return Ok(());
            }

            let snapshot = self.secondary_header;
            let header = self.header_sector_mut(GptCopy::Secondary);
            header.set_lba(alt_lba);
            header.set_partition_start_lba(alt_entries_lba);
            header.set_last_usable_lba(last_usable_lba);
            header.update_checksum();

            (GptCopy::Secondary, snapshot)
        } else {
            return Err(GptError::InvalidHeaders);
        };

        // Only the header just patched may come out of re-validation as the
        // valid one; anything else means the patch made matters worse and
        // must be undone.
        let (copy, snapshot) = patched;
        if self.sanity_check().is_err() || self.valid_headers != Validity::only(copy) {
            match copy {
                GptCopy::Primary => self.primary_header = snapshot,
                GptCopy::Secondary => self.secondary_header = snapshot,
            }
            let _ = self.sanity_check();
            return Err(GptError::InvalidHeaders);
        }

        // The secondary's location moved, so it must be rewritten no matter
        // which header carried the patch.
        self.modified.insert(GptRegion::SecondaryHeader);
        self.modified.insert(GptRegion::SecondaryEntries);
        if copy == GptCopy::Primary {
            self.modified.insert(GptRegion::PrimaryHeader);
        }

        Ok(())
    }

    /// Rebuilds any invalid copy from the surviving one.
    ///
    /// Requires at least one valid header and one valid entry table (per the
    /// last sanity pass); otherwise this is a no-op, as it is when geometry
    /// reconciliation fails. Repair is strictly asymmetric replication: the
    /// good copy's bytes overwrite the bad copy's wholesale, never a
    /// field-level merge. A rebuilt header gets its role-specific location
    /// fields re-pointed and its checksum resealed; a rebuilt entry table is
    /// copied over its claimed byte span exactly.
    ///
    /// Every overwritten region lands in the modified set, and both validity
    /// masks read `Both` afterwards.
    pub fn repair(&mut self) {
        if self.valid_headers.is_neither() || self.valid_entries.is_neither() {
            return;
        }

        if self.recompute_geometry().is_err() {
            return;
        }

        match self.valid_headers {
            Validity::PrimaryOnly => {
                let my_lba = self.drive_sectors - 1;
                self.secondary_header = self.primary_header;

                let header = self.header_sector_mut(GptCopy::Secondary);
                header.set_lba(my_lba);
                header.set_alternate_lba(1);
                header.set_partition_start_lba(my_lba - GPT_ENTRIES_SECTORS);
                header.update_checksum();

                self.modified.insert(GptRegion::SecondaryHeader);
            }
            Validity::SecondaryOnly => {
                let alternate_lba = self.drive_sectors - 1;
                self.primary_header = self.secondary_header;

                let header = self.header_sector_mut(GptCopy::Primary);
                header.set_lba(1);
                header.set_alternate_lba(alternate_lba);
                header.set_partition_start_lba(2);
                header.update_checksum();

                self.modified.insert(GptRegion::PrimaryHeader);
            }
            _ => {}
        }
        self.valid_headers = Validity::Both;

        let span = Self::entries_span(self.header(GptCopy::Primary));
        match self.valid_entries {
            Validity::PrimaryOnly => {
                self.secondary_entries[..span].copy_from_slice(&self.primary_entries[..span]);
                self.modified.insert(GptRegion::SecondaryEntries);
            }
            Validity::SecondaryOnly => {
                self.primary_entries[..span].copy_from_slice(&self.secondary_entries[..span]);
                self.modified.insert(GptRegion::PrimaryEntries);
            }
            _ => {}
        }
        self.valid_entries = Validity::Both;
    }

    /// Reseals the primary copy after caller edits and mirrors it onto the
    /// secondary.
    ///
    /// Call once the primary entry table has been modified in place (through
    /// [`GptImage::entry_mut`]). Both primary checksums are recomputed, the
    /// primary regions are marked modified, and both validity masks are
    /// forced to primary-only before handing off to [`GptImage::repair`],
    /// which then necessarily copies the primary over the secondary. The
    /// extra sanity pass repair performs is noise next to the cost of the
    /// physical writes.
    pub fn commit_primary_changes(&mut self) {
        let span = Self::entries_span(self.header(GptCopy::Primary));
        let entries_checksum = crc32fast::hash(&self.primary_entries[..span]);

        let header = self.header_sector_mut(GptCopy::Primary);
        header.set_partition_entries_checksum(entries_checksum);
        header.update_checksum();

        self.modified.insert(GptRegion::PrimaryHeader);
        self.modified.insert(GptRegion::PrimaryEntries);

        self.valid_headers = Validity::only(GptCopy::Primary);
        self.valid_entries = Validity::only(GptCopy::Primary);
        self.repair();
    }
}
