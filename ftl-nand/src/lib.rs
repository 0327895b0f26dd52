#![no_std]

//! Wear-leveling sector translation layer for NAND flash.
//!
//! NAND programs whole pages, keeps metadata in each page's spare area,
//! and grows bad blocks over its lifetime. This engine maps logical
//! sectors (one per data page) onto physical blocks through a runtime
//! block-mapping table rebuilt from spare metadata at mount. Updates
//! append within a block; full blocks migrate to a fresh block, dropping
//! garbage on the way. Every page and block state transition is a pure
//! bit-clear in the spare area, so any power cut resolves at the next
//! mount.

#[cfg(test)]
extern crate std;

mod fmt;
mod list;
mod spare;
mod wear;

use ftl_core::cache::{MappingBitmap, ObsoleteCountCache};
use ftl_core::{
    BlockIndex, BlockStatus, Diagnostics, FlashError, FlashErrorKind, LogicalSector,
    NandFlashDriver, PageIndex, SystemErrorCode, sector_count_for_len,
};
use list::BlockList;
use spare::{BlockState, PageState, SPARE_MAX, SPARE_MIN};
use wear::EraseCountTable;

const NO_BLOCK: u16 = 0xFFFF;

/// Blocks held out of the logical capacity: one migration destination and
/// one block of bad-block headroom.
const RESERVED_BLOCKS: usize = 2;

/// Consecutive freshly-bad blocks tolerated inside one operation before
/// giving up.
const MAX_BAD_BLOCK_RETRIES: usize = 8;

/// Erase-count spread that triggers cold-data migration when no garbage
/// is available to reclaim.
const DEFAULT_WEAR_THRESHOLD: u32 = 8;

#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NandFtlError<E> {
    /// Error from the flash driver
    #[error("flash driver error")]
    Flash(E),
    /// The logical sector has no live mapping
    #[error("sector not found")]
    SectorNotFound,
    /// No free pages remain, even after reclaim
    #[error("no free pages")]
    NoFreePages,
    /// Logical sector out of range
    #[error("invalid sector")]
    InvalidSector,
    /// Buffer length is not a whole number of sectors
    #[error("invalid buffer length")]
    InvalidWrite,
    /// Too many blocks failed back to back
    #[error("invalid block")]
    InvalidBlock,
    /// The media does not carry a recognizable layout; mount refused
    #[error("invalid media format")]
    InvalidFormat,
    /// The on-media structures violate an invariant
    #[error("structural invariant violated")]
    StructuralError,
    /// The block list ran out of room
    #[error("block list overflow")]
    ListOverflow,
}

/// NAND flash translation engine.
///
/// `BLOCK_COUNT` must equal the driver's block count and `PAGE` its page
/// size in bytes (const generics size the runtime tables and the internal
/// page buffer). The engine owns its driver; `&mut self` exclusivity is
/// the concurrency contract.
pub struct NandFtl<F: NandFlashDriver, const BLOCK_COUNT: usize, const PAGE: usize> {
    driver: F,
    name: &'static str,
    data_pages: u16,
    logical_blocks: u16,
    logical_sectors: u32,
    /// logical block id -> physical block
    mapping: [u16; BLOCK_COUNT],
    /// physical block -> logical block id it serves
    bound_to: [u16; BLOCK_COUNT],
    /// physical block -> next unprogrammed data page (PAGES_PER_BLOCK = full)
    free_position: [u16; BLOCK_COUNT],
    erase_counts: EraseCountTable<BLOCK_COUNT>,
    list: BlockList<BLOCK_COUNT>,
    good: [bool; BLOCK_COUNT],
    corrected: [u8; BLOCK_COUNT],
    scrub_threshold: Option<u8>,
    wear_threshold: u32,
    bitmap: Option<MappingBitmap>,
    obsolete_cache: Option<ObsoleteCountCache>,
    diag: Diagnostics,
}

impl<F: NandFlashDriver, const BLOCK_COUNT: usize, const PAGE: usize>
    NandFtl<F, BLOCK_COUNT, PAGE>
{
    /// Erase every good block, reset erase counts, and mount. Blocks that
    /// fail to erase are marked bad and skipped.
    pub fn format(mut driver: F, name: &'static str) -> Result<Self, NandFtlError<F::Error>> {
        Self::check_geometry()?;
        info!("{}: formatting {} blocks", name, BLOCK_COUNT);
        for b in 0..BLOCK_COUNT {
            let block = BlockIndex::new(b as u16);
            match driver.block_status_get(block) {
                Ok(BlockStatus::Bad) => continue,
                Ok(BlockStatus::Good) => {}
                Ok(_) => continue,
                Err(e) => return Err(NandFtlError::Flash(e)),
            }
            match driver.block_erase(block, 0) {
                Ok(()) => {}
                Err(e) if e.kind() == FlashErrorKind::EraseFail => {
                    warn!("{}: block {} failed format erase, marking bad", name, b as u32);
                    driver.system_error(
                        SystemErrorCode::DriverErase,
                        Some(block),
                        None,
                    );
                    let _ = driver.block_status_set(block, BlockStatus::Bad);
                    continue;
                }
                Err(e) => return Err(NandFtlError::Flash(e)),
            }
            driver
                .spare_write(block, PageIndex::new(0), &spare::erase_count_record(0))
                .map_err(NandFtlError::Flash)?;
        }
        Self::open(driver, name)
    }

    /// Mount existing media, rebuilding the runtime tables from spare
    /// metadata and completing any interrupted erase or migration.
    pub fn open(driver: F, name: &'static str) -> Result<Self, NandFtlError<F::Error>> {
        Self::check_geometry()?;
        let data_pages = (F::PAGES_PER_BLOCK - 1) as u16;
        let logical_blocks = (BLOCK_COUNT - RESERVED_BLOCKS) as u16;
        let mut ftl = NandFtl {
            driver,
            name,
            data_pages,
            logical_blocks,
            logical_sectors: logical_blocks as u32 * data_pages as u32,
            mapping: [NO_BLOCK; BLOCK_COUNT],
            bound_to: [NO_BLOCK; BLOCK_COUNT],
            free_position: [0; BLOCK_COUNT],
            erase_counts: EraseCountTable::new(),
            list: BlockList::new(),
            good: [false; BLOCK_COUNT],
            corrected: [0; BLOCK_COUNT],
            scrub_threshold: None,
            wear_threshold: DEFAULT_WEAR_THRESHOLD,
            bitmap: None,
            obsolete_cache: None,
            diag: Diagnostics::default(),
        };
        ftl.mount()?;
        Ok(ftl)
    }

    fn check_geometry() -> Result<(), NandFtlError<F::Error>> {
        if PAGE != F::PAGE_SIZE
            || BLOCK_COUNT != F::BLOCK_COUNT
            || F::SPARE_SIZE < SPARE_MIN
            || F::SPARE_SIZE > SPARE_MAX
            || F::PAGES_PER_BLOCK < 2
            || F::PAGES_PER_BLOCK > u16::MAX as usize
            || BLOCK_COUNT <= RESERVED_BLOCKS
            || BLOCK_COUNT > NO_BLOCK as usize
        {
            return Err(NandFtlError::InvalidFormat);
        }
        Ok(())
    }

    /// Release the engine and hand the driver back.
    pub fn close(self) -> F {
        self.driver
    }

    /// Consume the engine, returning the driver. Same as [`close`](Self::close).
    pub fn into_driver(self) -> F {
        self.driver
    }

    pub fn logical_sectors(&self) -> u32 {
        self.logical_sectors
    }

    /// Host-visible capacity in sectors.
    pub fn capacity(&self) -> u32 {
        self.logical_sectors
    }

    pub fn free_blocks(&self) -> usize {
        self.list.free_len()
    }

    pub fn erase_count(&self, block: BlockIndex) -> u32 {
        self.erase_counts.get(block.as_u16())
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    pub fn driver(&self) -> &F {
        &self.driver
    }

    /// Mutable driver access, for tests and diagnostics. Changing media
    /// state behind the engine's back invalidates its bookkeeping.
    pub fn driver_mut(&mut self) -> &mut F {
        &mut self.driver
    }

    pub fn set_wear_threshold(&mut self, threshold: u32) {
        self.wear_threshold = threshold;
    }

    /// Migrate a block after this many ECC-corrected reads. `None`
    /// restores the default log-only behavior.
    pub fn set_scrub_threshold(&mut self, threshold: Option<u8>) {
        self.scrub_threshold = threshold;
    }

    /// Enable the logical-sector mapping bitmap and seed it from media.
    pub fn mapping_bitmap_enable(
        &mut self,
        words: &'static mut [u32],
    ) -> Result<(), NandFtlError<F::Error>> {
        let mut bitmap = MappingBitmap::new(words);
        for mi in 0..self.logical_blocks {
            let pb = self.mapping[mi as usize];
            if pb == NO_BLOCK {
                continue;
            }
            for page in 1..self.free_position[pb as usize] {
                let sp = self.read_spare(pb, page)?;
                if spare::page_state(&sp) == PageState::Valid {
                    bitmap.set(LogicalSector::new(spare::page_logical(&sp)));
                }
            }
        }
        self.bitmap = Some(bitmap);
        Ok(())
    }

    /// Enable the per-block obsolete-page counters and seed them from
    /// media.
    pub fn obsolete_count_cache_enable(
        &mut self,
        counts: &'static mut [u16],
    ) -> Result<(), NandFtlError<F::Error>> {
        let mut cache = ObsoleteCountCache::new(counts);
        for b in 0..BLOCK_COUNT as u16 {
            if self.bound_to[b as usize] == NO_BLOCK {
                continue;
            }
            let garbage = self.count_garbage(b)?;
            cache.set(BlockIndex::new(b), garbage as u16);
        }
        self.obsolete_cache = Some(cache);
        Ok(())
    }

    /// Read one logical sector. `data` must be exactly one page.
    pub fn sector_read(
        &mut self,
        logical: LogicalSector,
        data: &mut [u8],
    ) -> Result<(), NandFtlError<F::Error>> {
        if data.len() != PAGE {
            return Err(NandFtlError::InvalidWrite);
        }
        if logical.as_u32() >= self.logical_sectors {
            return Err(NandFtlError::InvalidSector);
        }
        self.diag.read_requests += 1;
        if let Some(bm) = self.bitmap.as_ref() {
            if bm.is_mapped(logical) == Some(false) {
                return Err(NandFtlError::SectorNotFound);
            }
        }
        let (pb, page) = self
            .find_sector(logical)?
            .ok_or(NandFtlError::SectorNotFound)?;
        self.page_read_checked(pb, page, data)
    }

    /// Write one logical sector. `data` must be exactly one page.
    pub fn sector_write(
        &mut self,
        logical: LogicalSector,
        data: &[u8],
    ) -> Result<(), NandFtlError<F::Error>> {
        if data.len() != PAGE {
            return Err(NandFtlError::InvalidWrite);
        }
        if logical.as_u32() >= self.logical_sectors {
            return Err(NandFtlError::InvalidSector);
        }
        self.diag.write_requests += 1;
        self.ensure_free_blocks()?;
        let mi = (logical.as_u32() / self.data_pages as u32) as u16;

        for _ in 0..MAX_BAD_BLOCK_RETRIES {
            let pb = match self.mapping[mi as usize] {
                NO_BLOCK => self.bind_block(mi)?,
                pb => pb,
            };
            if self.free_position[pb as usize] >= F::PAGES_PER_BLOCK as u16 {
                // No room to append; compact into a fresh block, writing
                // the new payload on the way.
                return self.migrate(pb, mi, Some((logical, data)), false);
            }
            let page = self.free_position[pb as usize];
            let meta = spare::page_meta(logical.as_u32(), PageState::Tentative);
            match self
                .driver
                .page_write(BlockIndex::new(pb), PageIndex::new(page), data, &meta)
            {
                Ok(()) => {
                    self.free_position[pb as usize] = page + 1;
                    let old = self.find_valid_page(pb, logical.as_u32(), page)?;
                    if let Some(old_page) = old {
                        // The old copy must fall before the new one
                        // commits, otherwise a crash could leave two live
                        // copies with nothing to choose between.
                        self.write_status(pb, old_page, PageState::Superceded)?;
                        self.note_garbage(pb);
                    }
                    self.write_status(pb, page, PageState::Valid)?;
                    if let Some(bm) = self.bitmap.as_mut() {
                        bm.set(logical);
                    }
                    if self.free_position[pb as usize] >= F::PAGES_PER_BLOCK as u16 {
                        self.seal_block(pb)?;
                    }
                    return Ok(());
                }
                Err(e) if e.kind() == FlashErrorKind::ProgramFail => {
                    self.on_program_fail(pb, page)?;
                    continue;
                }
                Err(e) => {
                    self.diag.record_system_error(SystemErrorCode::DriverWrite);
                    self.driver.system_error(
                        SystemErrorCode::DriverWrite,
                        Some(BlockIndex::new(pb)),
                        Some(PageIndex::new(page)),
                    );
                    return Err(NandFtlError::Flash(e));
                }
            }
        }
        Err(NandFtlError::InvalidBlock)
    }

    /// Read contiguous logical sectors; `data` holds `len / PAGE` pages.
    pub fn sectors_read(
        &mut self,
        logical: LogicalSector,
        data: &mut [u8],
    ) -> Result<(), NandFtlError<F::Error>> {
        let count = sector_count_for_len(data.len(), PAGE).ok_or(NandFtlError::InvalidWrite)?;
        for (i, chunk) in data.chunks_exact_mut(PAGE).enumerate() {
            debug_assert!(i < count as usize);
            self.sector_read(logical + i as u32, chunk)?;
        }
        Ok(())
    }

    /// Write contiguous logical sectors. A failure at sector `k` halts the
    /// batch; sectors before it stay written. No rollback.
    pub fn sectors_write(
        &mut self,
        logical: LogicalSector,
        data: &[u8],
    ) -> Result<(), NandFtlError<F::Error>> {
        let count = sector_count_for_len(data.len(), PAGE).ok_or(NandFtlError::InvalidWrite)?;
        for (i, chunk) in data.chunks_exact(PAGE).enumerate() {
            debug_assert!(i < count as usize);
            self.sector_write(logical + i as u32, chunk)?;
        }
        Ok(())
    }

    /// Drop the mapping for a logical sector.
    pub fn sector_release(
        &mut self,
        logical: LogicalSector,
    ) -> Result<(), NandFtlError<F::Error>> {
        if logical.as_u32() >= self.logical_sectors {
            return Err(NandFtlError::InvalidSector);
        }
        let (pb, page) = self
            .find_sector(logical)?
            .ok_or(NandFtlError::SectorNotFound)?;
        self.diag.releases += 1;
        self.write_status(pb, page, PageState::Obsolete)?;
        self.note_garbage(pb);
        if let Some(bm) = self.bitmap.as_mut() {
            bm.clear(logical);
        }
        self.ensure_free_blocks()?;
        Ok(())
    }

    /// Run reclaim passes until nothing more can be compacted.
    pub fn defragment(&mut self) -> Result<(), NandFtlError<F::Error>> {
        self.partial_defragment(BLOCK_COUNT as u32)
    }

    /// Run at most `max_blocks` reclaim passes.
    pub fn partial_defragment(&mut self, max_blocks: u32) -> Result<(), NandFtlError<F::Error>> {
        for _ in 0..max_blocks {
            if !self.reclaim_once()? {
                break;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Spare access

    fn read_spare(&mut self, block: u16, page: u16) -> Result<[u8; SPARE_MAX], NandFtlError<F::Error>> {
        let mut buf = [0xFFu8; SPARE_MAX];
        match self.driver.spare_read(
            BlockIndex::new(block),
            PageIndex::new(page),
            &mut buf[..F::SPARE_SIZE],
        ) {
            Ok(()) => Ok(buf),
            Err(e) => {
                self.diag.record_system_error(SystemErrorCode::DriverRead);
                self.driver.system_error(
                    SystemErrorCode::DriverRead,
                    Some(BlockIndex::new(block)),
                    Some(PageIndex::new(page)),
                );
                Err(NandFtlError::Flash(e))
            }
        }
    }

    fn write_spare(
        &mut self,
        block: u16,
        page: u16,
        src: &[u8],
    ) -> Result<(), NandFtlError<F::Error>> {
        match self
            .driver
            .spare_write(BlockIndex::new(block), PageIndex::new(page), src)
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.diag.record_system_error(SystemErrorCode::DriverWrite);
                self.driver.system_error(
                    SystemErrorCode::DriverWrite,
                    Some(BlockIndex::new(block)),
                    Some(PageIndex::new(page)),
                );
                Err(NandFtlError::Flash(e))
            }
        }
    }

    fn write_status(
        &mut self,
        block: u16,
        page: u16,
        state: PageState,
    ) -> Result<(), NandFtlError<F::Error>> {
        self.write_spare(block, page, &spare::page_status_update(state))
    }

    fn note_garbage(&mut self, block: u16) {
        if let Some(oc) = self.obsolete_cache.as_mut() {
            oc.increment(BlockIndex::new(block));
        }
    }

    // ------------------------------------------------------------------
    // Lookup

    fn find_sector(
        &mut self,
        logical: LogicalSector,
    ) -> Result<Option<(u16, u16)>, NandFtlError<F::Error>> {
        let mi = (logical.as_u32() / self.data_pages as u32) as u16;
        let pb = self.mapping[mi as usize];
        if pb == NO_BLOCK {
            return Ok(None);
        }
        let limit = self.free_position[pb as usize];
        Ok(self
            .find_valid_page(pb, logical.as_u32(), limit)?
            .map(|page| (pb, page)))
    }

    /// Newest valid copy of `logical` among data pages below `limit`.
    fn find_valid_page(
        &mut self,
        block: u16,
        logical: u32,
        limit: u16,
    ) -> Result<Option<u16>, NandFtlError<F::Error>> {
        for page in (1..limit).rev() {
            let sp = self.read_spare(block, page)?;
            if spare::page_state(&sp) == PageState::Valid && spare::page_logical(&sp) == logical {
                return Ok(Some(page));
            }
        }
        Ok(None)
    }

    fn page_read_checked(
        &mut self,
        block: u16,
        page: u16,
        dest: &mut [u8],
    ) -> Result<(), NandFtlError<F::Error>> {
        match self
            .driver
            .page_read(BlockIndex::new(block), PageIndex::new(page), dest)
        {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == FlashErrorKind::Corrected => {
                self.diag.record_corrected(block, page);
                self.driver.system_error(
                    SystemErrorCode::EccCorrected,
                    Some(BlockIndex::new(block)),
                    Some(PageIndex::new(page)),
                );
                self.corrected[block as usize] = self.corrected[block as usize].saturating_add(1);
                if self
                    .scrub_threshold
                    .is_some_and(|t| self.corrected[block as usize] >= t)
                {
                    info!("{}: scrubbing degrading block {}", self.name, block as u32);
                    self.corrected[block as usize] = 0;
                    let mi = self.bound_to[block as usize];
                    if mi != NO_BLOCK {
                        if let Err(_e) = self.migrate(block, mi, None, false) {
                            warn!("{}: scrub of block {} failed", self.name, block as u32);
                        }
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.diag.record_system_error(SystemErrorCode::DriverRead);
                self.driver.system_error(
                    SystemErrorCode::DriverRead,
                    Some(BlockIndex::new(block)),
                    Some(PageIndex::new(page)),
                );
                Err(NandFtlError::Flash(e))
            }
        }
    }

    // ------------------------------------------------------------------
    // Allocation and bad blocks

    fn mark_bad(&mut self, block: u16) {
        warn!("{}: marking block {} bad", self.name, block as u32);
        let _ = self
            .driver
            .block_status_set(BlockIndex::new(block), BlockStatus::Bad);
        self.good[block as usize] = false;
        self.list.remove_mapped(block);
        self.bound_to[block as usize] = NO_BLOCK;
    }

    /// A page program failed: retire the block and move its live data.
    fn on_program_fail(&mut self, block: u16, page: u16) -> Result<(), NandFtlError<F::Error>> {
        self.diag.record_system_error(SystemErrorCode::DriverWrite);
        self.driver.system_error(
            SystemErrorCode::DriverWrite,
            Some(BlockIndex::new(block)),
            Some(PageIndex::new(page)),
        );
        let mi = self.bound_to[block as usize];
        self.mark_bad(block);
        if mi != NO_BLOCK {
            self.mapping[mi as usize] = NO_BLOCK;
            self.migrate(block, mi, None, true)?;
        }
        Ok(())
    }

    /// Bind a fresh block to a logical block id.
    fn bind_block(&mut self, mi: u16) -> Result<u16, NandFtlError<F::Error>> {
        for _ in 0..MAX_BAD_BLOCK_RETRIES {
            let Some(pb) = self.list.pop_free_min(&self.erase_counts) else {
                return Err(NandFtlError::NoFreePages);
            };
            match self.write_spare(pb, 0, &spare::allocation_record(mi, BlockState::Allocated)) {
                Ok(()) => {
                    self.mapping[mi as usize] = pb;
                    self.bound_to[pb as usize] = mi;
                    self.free_position[pb as usize] = 1;
                    return Ok(pb);
                }
                Err(NandFtlError::Flash(e)) if e.kind() == FlashErrorKind::ProgramFail => {
                    self.mark_bad(pb);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(NandFtlError::InvalidBlock)
    }

    /// A block just became fully programmed: record it on media and enter
    /// it into the erase-count-ordered mapped list.
    fn seal_block(&mut self, block: u16) -> Result<(), NandFtlError<F::Error>> {
        self.write_spare(block, 0, &spare::block_status_update(BlockState::Mapped))?;
        if self.list.insert_mapped(block, &self.erase_counts).is_err() {
            self.diag.record_system_error(SystemErrorCode::ListOverflow);
            self.driver.system_error(
                SystemErrorCode::ListOverflow,
                Some(BlockIndex::new(block)),
                None,
            );
            return Err(NandFtlError::ListOverflow);
        }
        Ok(())
    }

    /// Erase a block, persist its new erase count, and return it to the
    /// free list. An erase failure retires the block instead.
    fn recycle_block(&mut self, block: u16, new_count: u32) -> Result<(), NandFtlError<F::Error>> {
        match self.driver.block_erase(BlockIndex::new(block), new_count) {
            Ok(()) => {}
            Err(e) if e.kind() == FlashErrorKind::EraseFail => {
                self.diag.record_system_error(SystemErrorCode::DriverErase);
                self.driver.system_error(
                    SystemErrorCode::DriverErase,
                    Some(BlockIndex::new(block)),
                    None,
                );
                self.mark_bad(block);
                return Ok(());
            }
            Err(e) => {
                self.diag.record_system_error(SystemErrorCode::DriverErase);
                self.driver.system_error(
                    SystemErrorCode::DriverErase,
                    Some(BlockIndex::new(block)),
                    None,
                );
                return Err(NandFtlError::Flash(e));
            }
        }
        self.diag.block_erases += 1;
        let verified = self
            .driver
            .block_erased_verify(BlockIndex::new(block))
            .map_err(NandFtlError::Flash)?;
        if !verified {
            self.diag.record_system_error(SystemErrorCode::EraseVerify);
            self.driver.system_error(
                SystemErrorCode::EraseVerify,
                Some(BlockIndex::new(block)),
                None,
            );
            self.mark_bad(block);
            return Ok(());
        }
        match self.write_spare(block, 0, &spare::erase_count_record(new_count)) {
            Ok(()) => {}
            Err(NandFtlError::Flash(e)) if e.kind() == FlashErrorKind::ProgramFail => {
                self.mark_bad(block);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.erase_counts.set(block, new_count);
        self.free_position[block as usize] = 0;
        self.corrected[block as usize] = 0;
        if let Some(oc) = self.obsolete_cache.as_mut() {
            oc.reset(BlockIndex::new(block));
        }
        if self.list.push_free(block).is_err() {
            self.diag.record_system_error(SystemErrorCode::ListOverflow);
            self.driver.system_error(
                SystemErrorCode::ListOverflow,
                Some(BlockIndex::new(block)),
                None,
            );
            return Err(NandFtlError::ListOverflow);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Migration / reclaim

    /// Move everything live in `victim` into a fresh block, optionally
    /// folding in a replacement payload for one sector. The victim is
    /// erased and freed afterwards unless it already went bad.
    fn migrate(
        &mut self,
        victim: u16,
        mi: u16,
        replacement: Option<(LogicalSector, &[u8])>,
        victim_bad: bool,
    ) -> Result<(), NandFtlError<F::Error>> {
        let mut victim_bad = victim_bad;
        'attempt: for _ in 0..MAX_BAD_BLOCK_RETRIES {
            let Some(dest) = self.list.pop_free_min(&self.erase_counts) else {
                return Err(NandFtlError::NoFreePages);
            };
            trace!(
                "{}: migrating block {} -> {} (logical block {})",
                self.name,
                victim as u32,
                dest as u32,
                mi as u32
            );
            match self.write_spare(dest, 0, &spare::allocation_record(mi, BlockState::Allocated)) {
                Ok(()) => {}
                Err(NandFtlError::Flash(e)) if e.kind() == FlashErrorKind::ProgramFail => {
                    self.mark_bad(dest);
                    continue 'attempt;
                }
                Err(e) => return Err(e),
            }
            if !victim_bad {
                // The mark makes the victim identifiable if power dies
                // mid-copy: at mount, the RECLAIM_SRC twin loses.
                match self.write_spare(
                    victim,
                    0,
                    &spare::block_status_update(BlockState::ReclaimSrc),
                ) {
                    Ok(()) => {}
                    Err(NandFtlError::Flash(e)) if e.kind() == FlashErrorKind::ProgramFail => {
                        self.mark_bad(victim);
                        victim_bad = true;
                    }
                    Err(e) => return Err(e),
                }
            }
            let mut pos: u16 = 1;
            for page in 1..F::PAGES_PER_BLOCK as u16 {
                let sp = self.read_spare(victim, page)?;
                if spare::page_state(&sp) != PageState::Valid {
                    continue;
                }
                let l = spare::page_logical(&sp);
                if replacement.is_some_and(|(rl, _)| rl.as_u32() == l) {
                    continue;
                }
                match self.driver.page_copy(
                    BlockIndex::new(victim),
                    PageIndex::new(page),
                    BlockIndex::new(dest),
                    PageIndex::new(pos),
                ) {
                    Ok(()) => pos += 1,
                    Err(e) if e.kind() == FlashErrorKind::ProgramFail => {
                        self.mark_bad(dest);
                        continue 'attempt;
                    }
                    Err(e) => {
                        self.diag.record_system_error(SystemErrorCode::DriverWrite);
                        self.driver.system_error(
                            SystemErrorCode::DriverWrite,
                            Some(BlockIndex::new(dest)),
                            Some(PageIndex::new(pos)),
                        );
                        return Err(NandFtlError::Flash(e));
                    }
                }
            }
            if let Some((rl, data)) = replacement {
                // Written valid outright: if power dies before the victim
                // is erased, twin resolution prefers this copy.
                let meta = spare::page_meta(rl.as_u32(), PageState::Valid);
                match self.driver.page_write(
                    BlockIndex::new(dest),
                    PageIndex::new(pos),
                    data,
                    &meta,
                ) {
                    Ok(()) => pos += 1,
                    Err(e) if e.kind() == FlashErrorKind::ProgramFail => {
                        self.mark_bad(dest);
                        continue 'attempt;
                    }
                    Err(e) => {
                        self.diag.record_system_error(SystemErrorCode::DriverWrite);
                        self.driver.system_error(
                            SystemErrorCode::DriverWrite,
                            Some(BlockIndex::new(dest)),
                            Some(PageIndex::new(pos)),
                        );
                        return Err(NandFtlError::Flash(e));
                    }
                }
                if let Some(bm) = self.bitmap.as_mut() {
                    bm.set(rl);
                }
            }
            self.free_position[dest as usize] = pos;
            self.bound_to[dest as usize] = mi;
            self.mapping[mi as usize] = dest;
            if pos >= F::PAGES_PER_BLOCK as u16 {
                self.seal_block(dest)?;
            }
            self.list.remove_mapped(victim);
            self.bound_to[victim as usize] = NO_BLOCK;
            if let Some(oc) = self.obsolete_cache.as_mut() {
                oc.reset(BlockIndex::new(victim));
            }
            if !victim_bad {
                let new_count = self.erase_counts.get(victim).saturating_add(1);
                self.recycle_block(victim, new_count)?;
            }
            return Ok(());
        }
        Err(NandFtlError::InvalidBlock)
    }

    /// Keep a migration destination and one spare block available.
    fn ensure_free_blocks(&mut self) -> Result<(), NandFtlError<F::Error>> {
        for _ in 0..BLOCK_COUNT {
            if self.list.free_len() >= RESERVED_BLOCKS {
                break;
            }
            if !self.reclaim_once()? {
                break;
            }
        }
        Ok(())
    }

    fn count_garbage(&mut self, block: u16) -> Result<u32, NandFtlError<F::Error>> {
        let mut garbage = 0;
        for page in 1..self.free_position[block as usize] {
            let sp = self.read_spare(block, page)?;
            match spare::page_state(&sp) {
                PageState::Superceded | PageState::Obsolete => garbage += 1,
                _ => {}
            }
        }
        Ok(garbage)
    }

    fn count_live(&mut self, block: u16) -> Result<u32, NandFtlError<F::Error>> {
        let mut live = 0;
        for page in 1..self.free_position[block as usize] {
            if spare::page_state(&self.read_spare(block, page)?) == PageState::Valid {
                live += 1;
            }
        }
        Ok(live)
    }

    /// Erase-count spread across tracked blocks.
    fn wear_spread(&self) -> u32 {
        let mut min = u32::MAX;
        let mut max = 0;
        for &b in self.list.free_blocks().iter().chain(self.list.mapped_blocks()) {
            let c = self.erase_counts.get(b);
            min = min.min(c);
            max = max.max(c);
        }
        if min == u32::MAX { 0 } else { max - min }
    }

    /// One garbage-collection pass: reclaim the fully-mapped block with
    /// the most obsolete pages, or, when nothing is reclaimable and wear
    /// has spread too far, force the coldest block to move. Returns
    /// whether anything happened.
    fn reclaim_once(&mut self) -> Result<bool, NandFtlError<F::Error>> {
        let mut snapshot = [0u16; BLOCK_COUNT];
        let mapped = self.list.mapped_blocks();
        let mapped_len = mapped.len();
        snapshot[..mapped_len].copy_from_slice(mapped);

        let mut best: Option<(u32, u16)> = None;
        for &pb in &snapshot[..mapped_len] {
            let garbage = match self.obsolete_cache.as_ref().and_then(|oc| {
                oc.get(BlockIndex::new(pb))
            }) {
                Some(count) => count as u32,
                None => self.count_garbage(pb)?,
            };
            if garbage > 0 && best.is_none_or(|(g, _)| garbage > g) {
                best = Some((garbage, pb));
            }
        }
        let victim = match best {
            Some((_, pb)) => pb,
            None => {
                if self.wear_spread() <= self.wear_threshold {
                    return Ok(false);
                }
                match self.list.mapped_min() {
                    Some(pb) => pb,
                    None => return Ok(false),
                }
            }
        };
        self.diag.reclaims += 1;
        let mi = self.bound_to[victim as usize];
        if mi == NO_BLOCK {
            return Ok(false);
        }
        if self.count_live(victim)? == 0 {
            // Nothing worth copying: the whole block is garbage.
            self.mapping[mi as usize] = NO_BLOCK;
            self.list.remove_mapped(victim);
            self.bound_to[victim as usize] = NO_BLOCK;
            let new_count = self.erase_counts.get(victim).saturating_add(1);
            self.recycle_block(victim, new_count)?;
            return Ok(true);
        }
        self.migrate(victim, mi, None, false)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Mount

    fn mount(&mut self) -> Result<(), NandFtlError<F::Error>> {
        let mut pending_erase = [false; BLOCK_COUNT];
        let mut in_use = [false; BLOCK_COUNT];
        let mut known = 0u32;
        let mut erase_sum = 0u64;

        for b in 0..BLOCK_COUNT as u16 {
            let status = self
                .driver
                .block_status_get(BlockIndex::new(b))
                .map_err(NandFtlError::Flash)?;
            if !status.is_good() {
                debug!("{}: block {} is bad, excluded", self.name, b as u32);
                continue;
            }
            self.good[b as usize] = true;
            let sp = self.read_spare(b, 0)?;
            let count = spare::block_erase_count(&sp);
            if count == spare::NO_ERASE_COUNT {
                // Erase or erase-count write torn by power loss.
                pending_erase[b as usize] = true;
                continue;
            }
            let Some(state) = BlockState::decode(spare::block_state_byte(&sp)) else {
                error!("{}: block {} metadata unrecognized", self.name, b as u32);
                self.diag.record_system_error(SystemErrorCode::InvalidFormat);
                self.driver.system_error(
                    SystemErrorCode::InvalidFormat,
                    Some(BlockIndex::new(b)),
                    None,
                );
                return Err(NandFtlError::InvalidFormat);
            };
            self.erase_counts.set(b, count);
            known += 1;
            erase_sum += count as u64;
            match state {
                BlockState::Free => {
                    if self.list.push_free(b).is_err() {
                        return Err(NandFtlError::ListOverflow);
                    }
                    self.free_position[b as usize] = 0;
                }
                BlockState::Allocated | BlockState::Mapped | BlockState::ReclaimSrc => {
                    in_use[b as usize] = true;
                }
            }
        }
        if known == 0 {
            // A device that is all-ones everywhere is virgin, not ours to
            // repair: mount refuses rather than reformats.
            error!("{}: media is not formatted", self.name);
            return Err(NandFtlError::InvalidFormat);
        }
        let mean = (erase_sum / known as u64) as u32;

        for b in 0..BLOCK_COUNT as u16 {
            if !pending_erase[b as usize] {
                continue;
            }
            debug!("{}: completing interrupted erase of block {}", self.name, b as u32);
            let erased = self
                .driver
                .block_erased_verify(BlockIndex::new(b))
                .map_err(NandFtlError::Flash)?;
            if erased {
                // Only the erase-count record was lost.
                self.write_spare(b, 0, &spare::erase_count_record(mean))?;
                self.erase_counts.set(b, mean);
                self.free_position[b as usize] = 0;
                if self.list.push_free(b).is_err() {
                    return Err(NandFtlError::ListOverflow);
                }
            } else {
                self.recycle_block(b, mean)?;
            }
        }

        // Bind in-use blocks to logical ids; a duplicate id means a
        // migration was interrupted mid-copy.
        for b in 0..BLOCK_COUNT as u16 {
            if !in_use[b as usize] {
                continue;
            }
            let sp = self.read_spare(b, 0)?;
            let mi = spare::mapping_index(&sp);
            if mi == spare::NO_MAPPING || mi as usize >= BLOCK_COUNT {
                error!("{}: block {} carries mapping id {}", self.name, b as u32, mi as u32);
                self.diag.record_system_error(SystemErrorCode::InvalidFormat);
                self.driver.system_error(
                    SystemErrorCode::InvalidFormat,
                    Some(BlockIndex::new(b)),
                    None,
                );
                return Err(NandFtlError::InvalidFormat);
            }
            let twin = self.mapping[mi as usize];
            if twin == NO_BLOCK {
                self.mapping[mi as usize] = b;
                self.bound_to[b as usize] = mi;
            } else {
                self.resolve_twin(twin, b, mi)?;
            }
        }

        // Per-block page scan: free positions, torn programs, in-flight
        // updates, list membership.
        for b in 0..BLOCK_COUNT as u16 {
            if self.bound_to[b as usize] == NO_BLOCK || !self.good[b as usize] {
                continue;
            }
            self.rebuild_block(b)?;
        }

        info!(
            "{}: mounted, {} blocks ({} free, {} in mapped list), {} logical sectors",
            self.name,
            BLOCK_COUNT,
            self.list.free_len(),
            self.list.mapped_len(),
            self.logical_sectors
        );
        Ok(())
    }

    /// Two blocks claim one logical id: finish the interrupted migration.
    /// The RECLAIM_SRC-marked block is the source being emptied; a fresh
    /// twin with no data at all is simply a destination that never got
    /// started.
    fn resolve_twin(
        &mut self,
        first: u16,
        second: u16,
        mi: u16,
    ) -> Result<(), NandFtlError<F::Error>> {
        let first_state = BlockState::decode(spare::block_state_byte(&self.read_spare(first, 0)?));
        let second_state =
            BlockState::decode(spare::block_state_byte(&self.read_spare(second, 0)?));
        let (victim, dest) = match (first_state, second_state) {
            (Some(BlockState::ReclaimSrc), _) => (first, second),
            (_, Some(BlockState::ReclaimSrc)) => (second, first),
            _ => {
                // Neither is marked: the migration never copied anything.
                // The twin without data is the abandoned destination.
                if self.first_programmed_page(second)?.is_none() {
                    (second, first)
                } else if self.first_programmed_page(first)?.is_none() {
                    (first, second)
                } else {
                    error!(
                        "{}: blocks {} and {} both claim logical block {}",
                        self.name, first as u32, second as u32, mi as u32
                    );
                    self.diag
                        .record_system_error(SystemErrorCode::MappingInconsistent);
                    self.driver.system_error(
                        SystemErrorCode::MappingInconsistent,
                        Some(BlockIndex::new(second)),
                        None,
                    );
                    return Err(NandFtlError::InvalidFormat);
                }
            }
        };
        debug!(
            "{}: completing interrupted migration {} -> {} (logical block {})",
            self.name, victim as u32, dest as u32, mi as u32
        );

        // Find where the destination's programmed pages end, retiring any
        // page whose program was torn so it is never written over.
        let mut pos = 1;
        while pos < F::PAGES_PER_BLOCK as u16 {
            let sp = self.read_spare(dest, pos)?;
            if spare::page_state(&sp) == PageState::Free
                && spare::page_logical(&sp) == spare::NO_SECTOR
            {
                let erased = self
                    .driver
                    .page_erased_verify(BlockIndex::new(dest), PageIndex::new(pos))
                    .map_err(NandFtlError::Flash)?;
                if erased {
                    break;
                }
                self.write_status(dest, pos, PageState::Obsolete)?;
            }
            pos += 1;
        }

        // Copy over anything live the destination does not hold yet.
        for page in 1..F::PAGES_PER_BLOCK as u16 {
            let sp = self.read_spare(victim, page)?;
            if spare::page_state(&sp) != PageState::Valid {
                continue;
            }
            let l = spare::page_logical(&sp);
            if self.find_valid_page(dest, l, pos)?.is_some() {
                continue;
            }
            if pos >= F::PAGES_PER_BLOCK as u16 {
                return Err(NandFtlError::StructuralError);
            }
            self.driver
                .page_copy(
                    BlockIndex::new(victim),
                    PageIndex::new(page),
                    BlockIndex::new(dest),
                    PageIndex::new(pos),
                )
                .map_err(NandFtlError::Flash)?;
            pos += 1;
        }
        self.mapping[mi as usize] = dest;
        self.bound_to[dest as usize] = mi;
        self.bound_to[victim as usize] = NO_BLOCK;
        let new_count = self.erase_counts.get(victim).saturating_add(1);
        self.recycle_block(victim, new_count)?;
        Ok(())
    }

    fn first_programmed_page(&mut self, block: u16) -> Result<Option<u16>, NandFtlError<F::Error>> {
        for page in 1..F::PAGES_PER_BLOCK as u16 {
            let sp = self.read_spare(block, page)?;
            if spare::page_state(&sp) != PageState::Free
                || spare::page_logical(&sp) != spare::NO_SECTOR
            {
                return Ok(Some(page));
            }
        }
        Ok(None)
    }

    /// Rebuild one in-use block's runtime state: locate its append
    /// position, retire torn programs, resolve in-flight updates, and
    /// enter it into the mapped list when full.
    fn rebuild_block(&mut self, block: u16) -> Result<(), NandFtlError<F::Error>> {
        let ppb = F::PAGES_PER_BLOCK as u16;
        let mut pos = ppb;
        let mut page = 1;
        while page < ppb {
            let sp = self.read_spare(block, page)?;
            let state = spare::page_state(&sp);
            let logical = spare::page_logical(&sp);
            if state == PageState::Free {
                if logical != spare::NO_SECTOR {
                    // Program torn after the logical field landed.
                    self.write_status(block, page, PageState::Obsolete)?;
                    page += 1;
                    continue;
                }
                // Candidate append position; a torn program that never
                // reached the spare leaves dirty main-area cells.
                let erased = self
                    .driver
                    .page_erased_verify(BlockIndex::new(block), PageIndex::new(page))
                    .map_err(NandFtlError::Flash)?;
                if !erased {
                    debug!(
                        "{}: retiring torn page {} in block {}",
                        self.name, page as u32, block as u32
                    );
                    self.write_status(block, page, PageState::Obsolete)?;
                    page += 1;
                    continue;
                }
                pos = page;
                break;
            }
            page += 1;
        }
        self.free_position[block as usize] = pos;

        // Resolve in-flight updates now that the block's extent is known.
        for page in 1..pos {
            let sp = self.read_spare(block, page)?;
            if spare::page_state(&sp) != PageState::Tentative {
                continue;
            }
            let l = spare::page_logical(&sp);
            if self.find_valid_page(block, l, pos)?.is_some() {
                debug!("{}: rolling back interrupted update of sector {}", self.name, l);
                self.write_status(block, page, PageState::Obsolete)?;
            } else {
                debug!("{}: completing interrupted update of sector {}", self.name, l);
                self.write_status(block, page, PageState::Valid)?;
            }
        }

        if pos >= ppb {
            let sp = self.read_spare(block, 0)?;
            if BlockState::decode(spare::block_state_byte(&sp)) == Some(BlockState::Allocated) {
                // Filled completely, then power died before the seal.
                self.write_spare(block, 0, &spare::block_status_update(BlockState::Mapped))?;
            }
            if self.list.insert_mapped(block, &self.erase_counts).is_err() {
                return Err(NandFtlError::ListOverflow);
            }
        }
        Ok(())
    }
}
