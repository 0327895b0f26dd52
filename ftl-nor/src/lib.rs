#![no_std]

//! Wear-leveling sector translation layer for NOR flash.
//!
//! NOR parts are word-addressable and byte-writable, but writes can only
//! clear bits until a whole block is erased back to all-ones. This engine
//! presents a linear array of fixed-size logical sectors on top of that:
//! every update writes a fresh physical copy, retires the old mapping
//! entry, and garbage-collects mostly-obsolete blocks, keeping every
//! intermediate state recoverable after power loss.

#[cfg(test)]
extern crate std;

mod fmt;
mod layout;

use ftl_core::cache::{
    ExtendedSectorCache, MappingBitmap, ObsoleteCountCache, SectorCacheLine, SectorLocation,
    SectorMapCache,
};
use ftl_core::{
    BlockIndex, Diagnostics, LogicalSector, NorFlashDriver, SystemErrorCode, WordAddress,
    sector_count_for_len,
};
use layout::{
    BlockHeader, EntryState, Geometry, HEADER_COUNT_MASK, MAX_BITMAP_WORDS, commit_word,
    decode_entry, decode_header, encode_header, encode_tentative, retire_word,
};

pub use ftl_core::cache::SectorCacheLine as CacheLine;

/// Entries in the built-in logical-to-physical lookup cache.
const MAP_CACHE_ENTRIES: usize = 16;

/// Reclaim prefers destination sectors in blocks no more worn than the
/// victim plus this margin.
const DEFAULT_WEAR_THRESHOLD: u32 = 4;

#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NorFtlError<E> {
    /// Error from the flash driver
    #[error("flash driver error")]
    Flash(E),
    /// The logical sector has no live mapping
    #[error("sector not found")]
    SectorNotFound,
    /// No free physical sectors remain, even after reclaim
    #[error("no free sectors")]
    NoFreeSectors,
    /// Logical sector out of range
    #[error("invalid sector")]
    InvalidSector,
    /// Buffer length is not a whole number of sectors
    #[error("invalid buffer length")]
    InvalidWrite,
    /// The media does not carry a recognizable layout; mount refused
    #[error("invalid media format")]
    InvalidFormat,
    /// The on-media structures violate an invariant
    #[error("structural invariant violated")]
    StructuralError,
}

/// NOR flash translation engine.
///
/// `W` is the sector payload size in 32-bit words. The engine owns its
/// driver; exclusive access (`&mut self`) is the concurrency contract, so
/// wrap the engine in a mutex if several tasks share it.
pub struct NorFtl<F: NorFlashDriver, const W: usize> {
    driver: F,
    name: &'static str,
    geo: Geometry,
    logical_sectors: u32,
    free_sectors: u32,
    mapped_sectors: u32,
    obsolete_sectors: u32,
    wear_threshold: u32,
    diag: Diagnostics,
    map_cache: SectorMapCache<MAP_CACHE_ENTRIES>,
    extended_cache: Option<ExtendedSectorCache<W>>,
    bitmap: Option<MappingBitmap>,
    obsolete_cache: Option<ObsoleteCountCache>,
}

impl<F: NorFlashDriver, const W: usize> NorFtl<F, W> {
    /// Erase the whole device, write fresh block headers with erase count
    /// zero, and mount it.
    pub fn format(mut driver: F, name: &'static str) -> Result<Self, NorFtlError<F::Error>> {
        let geo = Geometry::for_device(F::WORDS_PER_BLOCK, F::BLOCK_COUNT, W)
            .ok_or(NorFtlError::InvalidFormat)?;
        info!(
            "{}: formatting {} blocks, {} sectors per block",
            name, geo.block_count, geo.sectors_per_block
        );
        for b in 0..geo.block_count {
            let block = BlockIndex::new(b as u16);
            driver
                .block_erase(block, 0)
                .map_err(NorFtlError::Flash)?;
            driver
                .write(geo.header_address(block), &[encode_header(0)])
                .map_err(NorFtlError::Flash)?;
        }
        Self::open(driver, name)
    }

    /// Mount existing media. Refuses anything that does not decode as this
    /// layout; a fresh device must be [`format`](Self::format)ted first.
    pub fn open(driver: F, name: &'static str) -> Result<Self, NorFtlError<F::Error>> {
        let geo = Geometry::for_device(F::WORDS_PER_BLOCK, F::BLOCK_COUNT, W)
            .ok_or(NorFtlError::InvalidFormat)?;
        let mut ftl = NorFtl {
            driver,
            name,
            geo,
            logical_sectors: geo.logical_sectors(),
            free_sectors: 0,
            mapped_sectors: 0,
            obsolete_sectors: 0,
            wear_threshold: DEFAULT_WEAR_THRESHOLD,
            diag: Diagnostics::default(),
            map_cache: SectorMapCache::new(),
            extended_cache: None,
            bitmap: None,
            obsolete_cache: None,
        };
        ftl.mount()?;
        Ok(ftl)
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

    pub fn free_sectors(&self) -> u32 {
        self.free_sectors
    }

    pub fn mapped_sectors(&self) -> u32 {
        self.mapped_sectors
    }

    pub fn obsolete_sectors(&self) -> u32 {
        self.obsolete_sectors
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

    /// Enable the whole-payload read cache over caller-provided lines.
    pub fn extended_cache_enable(&mut self, lines: &'static mut [SectorCacheLine<W>]) {
        info!("{}: extended cache enabled, {} lines", self.name, lines.len());
        self.extended_cache = Some(ExtendedSectorCache::new(lines));
    }

    /// Enable the logical-sector mapping bitmap and seed it from media.
    /// Sectors beyond the provided words fall back to media scans.
    pub fn mapping_bitmap_enable(
        &mut self,
        words: &'static mut [u32],
    ) -> Result<(), NorFtlError<F::Error>> {
        let mut bitmap = MappingBitmap::new(words);
        for b in 0..self.geo.block_count {
            let block = BlockIndex::new(b as u16);
            for idx in 0..self.geo.sectors_per_block {
                if let EntryState::Live(l) = self.entry_state(block, idx)? {
                    bitmap.set(LogicalSector::new(l as u32));
                }
            }
        }
        self.bitmap = Some(bitmap);
        Ok(())
    }

    /// Enable the per-block obsolete-sector counters and seed them from
    /// media. Blocks beyond the provided slice are not tracked.
    pub fn obsolete_count_cache_enable(
        &mut self,
        counts: &'static mut [u16],
    ) -> Result<(), NorFtlError<F::Error>> {
        let mut cache = ObsoleteCountCache::new(counts);
        for b in 0..self.geo.block_count {
            let block = BlockIndex::new(b as u16);
            let summary = self.scan_block(block)?;
            cache.set(block, summary.garbage as u16);
        }
        self.obsolete_cache = Some(cache);
        Ok(())
    }

    /// Read one logical sector. `data` must be exactly `W` words.
    pub fn sector_read(
        &mut self,
        logical: LogicalSector,
        data: &mut [u32],
    ) -> Result<(), NorFtlError<F::Error>> {
        if data.len() != W {
            return Err(NorFtlError::InvalidWrite);
        }
        if logical.as_u32() >= self.logical_sectors {
            return Err(NorFtlError::InvalidSector);
        }
        self.diag.read_requests += 1;
        let (block, idx) = self
            .logical_sector_find(logical)?
            .ok_or(NorFtlError::SectorNotFound)?;
        let mut payload = [0u32; W];
        self.read_payload(self.geo.payload_address(block, idx), &mut payload)?;
        data.copy_from_slice(&payload);
        Ok(())
    }

    /// Write one logical sector. `data` must be exactly `W` words.
    pub fn sector_write(
        &mut self,
        logical: LogicalSector,
        data: &[u32],
    ) -> Result<(), NorFtlError<F::Error>> {
        if data.len() != W {
            return Err(NorFtlError::InvalidWrite);
        }
        if logical.as_u32() >= self.logical_sectors {
            return Err(NorFtlError::InvalidSector);
        }
        self.diag.write_requests += 1;
        self.ensure_free_pool()?;

        let old = self.logical_sector_find(logical)?;
        let (block, idx) = self
            .allocate_sector(None, None)?
            .ok_or(NorFtlError::NoFreeSectors)?;

        // Mapping is about to move; the cache entry must die first.
        self.map_cache.invalidate(logical);

        self.write_words(self.geo.payload_address(block, idx), data)?;
        let tentative = encode_tentative(logical.as_u32() as u16);
        self.write_words(self.geo.entry_address(block, idx), &[tentative])?;

        if let Some((old_block, old_idx)) = old {
            self.retire_entry(old_block, old_idx)?;
            self.mapped_sectors -= 1;
        }
        // Committing last makes every crash window resolvable: with the
        // old entry gone, a lone tentative entry is promoted at open.
        self.write_words(
            self.geo.entry_address(block, idx),
            &[commit_word(tentative)],
        )?;

        self.mapped_sectors += 1;
        self.map_cache.insert(
            logical,
            SectorLocation {
                block,
                index: idx as u16,
            },
        );
        if let Some(bm) = self.bitmap.as_mut() {
            bm.set(logical);
        }
        Ok(())
    }

    /// Read `data.len() / W` contiguous logical sectors starting at
    /// `logical`.
    pub fn sectors_read(
        &mut self,
        logical: LogicalSector,
        data: &mut [u32],
    ) -> Result<(), NorFtlError<F::Error>> {
        let count = sector_count_for_len(data.len(), W).ok_or(NorFtlError::InvalidWrite)?;
        for (i, chunk) in data.chunks_exact_mut(W).enumerate() {
            debug_assert!(i < count as usize);
            self.sector_read(logical + i as u32, chunk)?;
        }
        Ok(())
    }

    /// Write `data.len() / W` contiguous logical sectors. A failure at
    /// sector `k` halts the batch; sectors before it stay written.
    pub fn sectors_write(
        &mut self,
        logical: LogicalSector,
        data: &[u32],
    ) -> Result<(), NorFtlError<F::Error>> {
        let count = sector_count_for_len(data.len(), W).ok_or(NorFtlError::InvalidWrite)?;
        for (i, chunk) in data.chunks_exact(W).enumerate() {
            debug_assert!(i < count as usize);
            self.sector_write(logical + i as u32, chunk)?;
        }
        Ok(())
    }

    /// Drop the mapping for a logical sector. Subsequent reads return
    /// [`NorFtlError::SectorNotFound`] until it is written again.
    pub fn sector_release(
        &mut self,
        logical: LogicalSector,
    ) -> Result<(), NorFtlError<F::Error>> {
        if logical.as_u32() >= self.logical_sectors {
            return Err(NorFtlError::InvalidSector);
        }
        let (block, idx) = self
            .logical_sector_find(logical)?
            .ok_or(NorFtlError::SectorNotFound)?;
        self.diag.releases += 1;
        self.map_cache.invalidate(logical);
        self.retire_entry(block, idx)?;
        self.mapped_sectors -= 1;
        if let Some(bm) = self.bitmap.as_mut() {
            bm.clear(logical);
        }
        self.ensure_free_pool()?;
        Ok(())
    }

    /// Run reclaim passes until no whole block of garbage remains.
    pub fn defragment(&mut self) -> Result<(), NorFtlError<F::Error>> {
        self.partial_defragment(self.geo.block_count)
    }

    /// Run at most `max_blocks` reclaim passes.
    pub fn partial_defragment(&mut self, max_blocks: u32) -> Result<(), NorFtlError<F::Error>> {
        for _ in 0..max_blocks {
            if !self.block_reclaim()? {
                break;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Driver wrappers

    fn read_words(
        &mut self,
        address: WordAddress,
        dest: &mut [u32],
    ) -> Result<(), NorFtlError<F::Error>> {
        match self.driver.read(address, dest) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.diag.record_system_error(SystemErrorCode::DriverRead);
                self.driver.system_error(SystemErrorCode::DriverRead);
                Err(NorFtlError::Flash(e))
            }
        }
    }

    fn read_word(&mut self, address: WordAddress) -> Result<u32, NorFtlError<F::Error>> {
        let mut word = [0u32; 1];
        self.read_words(address, &mut word)?;
        Ok(word[0])
    }

    /// All engine writes funnel through here so a one-word metadata write
    /// can patch a cached payload in place.
    fn write_words(
        &mut self,
        address: WordAddress,
        src: &[u32],
    ) -> Result<(), NorFtlError<F::Error>> {
        if src.len() == 1 {
            if let Some(cache) = self.extended_cache.as_mut() {
                cache.word_update(address, src[0]);
            }
        }
        match self.driver.write(address, src) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.diag.record_system_error(SystemErrorCode::DriverWrite);
                self.driver.system_error(SystemErrorCode::DriverWrite);
                Err(NorFtlError::Flash(e))
            }
        }
    }

    fn read_payload(
        &mut self,
        address: WordAddress,
        dest: &mut [u32; W],
    ) -> Result<(), NorFtlError<F::Error>> {
        if let Some(cache) = self.extended_cache.as_mut() {
            if let Some(data) = cache.lookup(address) {
                dest.copy_from_slice(data);
                return Ok(());
            }
        }
        self.read_words(address, dest)?;
        if let Some(cache) = self.extended_cache.as_mut() {
            cache.insert(address, dest);
        }
        Ok(())
    }

    /// Erase a block and write its fresh header. Invalidate cached
    /// payloads in its range first.
    fn erase_block(
        &mut self,
        block: BlockIndex,
        new_count: u32,
    ) -> Result<(), NorFtlError<F::Error>> {
        if let Some(cache) = self.extended_cache.as_mut() {
            let start = self.geo.block_base(block);
            cache.invalidate_range(start, start + self.geo.words_per_block);
        }
        match self.driver.block_erase(block, new_count) {
            Ok(()) => {}
            Err(e) => {
                self.diag.record_system_error(SystemErrorCode::DriverErase);
                self.driver.system_error(SystemErrorCode::DriverErase);
                return Err(NorFtlError::Flash(e));
            }
        }
        self.diag.block_erases += 1;
        let verified = self
            .driver
            .block_erased_verify(block)
            .map_err(NorFtlError::Flash)?;
        if !verified {
            warn!("{}: block {} failed erase verify, retrying", self.name, block.as_u16());
            self.driver
                .block_erase(block, new_count)
                .map_err(NorFtlError::Flash)?;
            if !self
                .driver
                .block_erased_verify(block)
                .map_err(NorFtlError::Flash)?
            {
                self.diag.record_system_error(SystemErrorCode::EraseVerify);
                self.driver.system_error(SystemErrorCode::EraseVerify);
                return Err(NorFtlError::StructuralError);
            }
        }
        self.write_words(self.geo.header_address(block), &[encode_header(new_count)])?;
        if let Some(oc) = self.obsolete_cache.as_mut() {
            oc.reset(block);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // On-media helpers

    fn entry_state(
        &mut self,
        block: BlockIndex,
        idx: u32,
    ) -> Result<EntryState, NorFtlError<F::Error>> {
        Ok(decode_entry(self.read_word(self.geo.entry_address(block, idx))?))
    }

    fn block_erase_count(&mut self, block: BlockIndex) -> Result<Option<u32>, NorFtlError<F::Error>> {
        match decode_header(self.read_word(self.geo.header_address(block))?) {
            BlockHeader::Formatted(c) => Ok(Some(c)),
            _ => Ok(None),
        }
    }

    fn free_bits(
        &mut self,
        block: BlockIndex,
    ) -> Result<[u32; MAX_BITMAP_WORDS], NorFtlError<F::Error>> {
        let mut words = [0u32; MAX_BITMAP_WORDS];
        let n = self.geo.bitmap_words as usize;
        let (addr, _) = self.geo.free_bit(block, 0);
        self.read_words(addr, &mut words[..n])?;
        Ok(words)
    }

    /// Clear one sector's free bit, claiming it for programming.
    fn claim_sector(&mut self, block: BlockIndex, idx: u32) -> Result<(), NorFtlError<F::Error>> {
        let (addr, bit) = self.geo.free_bit(block, idx);
        self.write_words(addr, &[!(1u32 << bit)])?;
        self.free_sectors -= 1;
        Ok(())
    }

    /// Retire a mapping entry (clears VALID and SUPERCEDED), counting the
    /// sector as garbage.
    fn retire_entry(&mut self, block: BlockIndex, idx: u32) -> Result<(), NorFtlError<F::Error>> {
        let addr = self.geo.entry_address(block, idx);
        let entry = self.read_word(addr)?;
        self.write_words(addr, &[retire_word(entry)])?;
        self.obsolete_sectors += 1;
        if let Some(oc) = self.obsolete_cache.as_mut() {
            oc.increment(block);
        }
        Ok(())
    }

    /// Locate the live physical copy of a logical sector, through the
    /// caches when possible, by forward media scan otherwise.
    fn logical_sector_find(
        &mut self,
        logical: LogicalSector,
    ) -> Result<Option<(BlockIndex, u32)>, NorFtlError<F::Error>> {
        if let Some(loc) = self.map_cache.lookup(logical) {
            return Ok(Some((loc.block, loc.index as u32)));
        }
        if let Some(bm) = self.bitmap.as_ref() {
            if bm.is_mapped(logical) == Some(false) {
                return Ok(None);
            }
        }
        let found = self.find_live_on_media(logical)?;
        if let Some((block, idx)) = found {
            self.map_cache.insert(
                logical,
                SectorLocation {
                    block,
                    index: idx as u16,
                },
            );
        }
        Ok(found)
    }

    fn find_live_on_media(
        &mut self,
        logical: LogicalSector,
    ) -> Result<Option<(BlockIndex, u32)>, NorFtlError<F::Error>> {
        let target = logical.as_u32() as u16;
        for b in 0..self.geo.block_count {
            let block = BlockIndex::new(b as u16);
            if self.block_erase_count(block)?.is_none() {
                continue;
            }
            for idx in 0..self.geo.sectors_per_block {
                if self.entry_state(block, idx)? == EntryState::Live(target) {
                    return Ok(Some((block, idx)));
                }
            }
        }
        Ok(None)
    }

    /// Pick and claim a free sector: lowest erase count first, restricted
    /// to blocks at or under `ceiling` when one is given (falling back to
    /// any block), never in `exclude`.
    fn allocate_sector(
        &mut self,
        ceiling: Option<u32>,
        exclude: Option<BlockIndex>,
    ) -> Result<Option<(BlockIndex, u32)>, NorFtlError<F::Error>> {
        let mut best: Option<(u32, BlockIndex, u32)> = None;
        for b in 0..self.geo.block_count {
            let block = BlockIndex::new(b as u16);
            if exclude == Some(block) {
                continue;
            }
            let Some(count) = self.block_erase_count(block)? else {
                continue;
            };
            if ceiling.is_some_and(|c| count > c) {
                continue;
            }
            if best.is_some_and(|(bc, _, _)| bc <= count) {
                continue;
            }
            let bits = self.free_bits(block)?;
            let first_free = (0..self.geo.sectors_per_block)
                .find(|&i| bits[(i >> 5) as usize] & (1 << (i & 31)) != 0);
            if let Some(idx) = first_free {
                best = Some((count, block, idx));
            }
        }
        match best {
            Some((_, block, idx)) => {
                self.claim_sector(block, idx)?;
                Ok(Some((block, idx)))
            }
            None => {
                if ceiling.is_some() {
                    // Relax the wear preference rather than fail.
                    self.allocate_sector(None, exclude)
                } else {
                    Ok(None)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Reclaim

    /// Keep at least one block's worth of free sectors, reclaiming
    /// garbage-heavy blocks as needed. Bounded by the block count; making
    /// no progress is not an error (the next allocation reports it).
    fn ensure_free_pool(&mut self) -> Result<(), NorFtlError<F::Error>> {
        for _ in 0..self.geo.block_count {
            if self.free_sectors > self.geo.sectors_per_block {
                break;
            }
            self.block_reclaim()?;
        }
        Ok(())
    }

    fn select_victim(&mut self) -> Result<Option<BlockIndex>, NorFtlError<F::Error>> {
        if let Some(oc) = self.obsolete_cache.as_ref() {
            if oc.covered_blocks() as u32 >= self.geo.block_count {
                return Ok(oc.max_block().map(|(b, _)| b));
            }
        }
        let mut best: Option<(u32, BlockIndex)> = None;
        for b in 0..self.geo.block_count {
            let block = BlockIndex::new(b as u16);
            if self.block_erase_count(block)?.is_none() {
                continue;
            }
            let summary = self.scan_block(block)?;
            if summary.garbage > 0 && best.is_none_or(|(g, _)| summary.garbage > g) {
                best = Some((summary.garbage, block));
            }
        }
        Ok(best.map(|(_, b)| b))
    }

    /// Copy every live sector out of the garbage-heaviest block, then
    /// erase it. Returns whether a block was actually erased.
    fn block_reclaim(&mut self) -> Result<bool, NorFtlError<F::Error>> {
        let Some(victim) = self.select_victim()? else {
            return Ok(false);
        };
        let Some(victim_count) = self.block_erase_count(victim)? else {
            return Ok(false);
        };
        self.diag.reclaims += 1;
        trace!("{}: reclaiming block {}", self.name, victim.as_u16());

        let mut moved_out = 0u32;
        let mut garbage = 0u32;
        let bits = self.free_bits(victim)?;
        for idx in 0..self.geo.sectors_per_block {
            let bit_free = bits[(idx >> 5) as usize] & (1 << (idx & 31)) != 0;
            match self.entry_state(victim, idx)? {
                EntryState::Live(l) => {
                    let Some((dest_block, dest_idx)) = self.allocate_sector(
                        Some(victim_count + self.wear_threshold),
                        Some(victim),
                    )?
                    else {
                        // Free pool exhausted mid-copy; the moved sectors
                        // already count as garbage, so a later pass picks
                        // this victim up again.
                        return Ok(false);
                    };
                    let mut payload = [0u32; W];
                    self.read_payload(self.geo.payload_address(victim, idx), &mut payload)?;
                    let logical = LogicalSector::new(l as u32);
                    self.map_cache.invalidate(logical);
                    self.write_words(self.geo.payload_address(dest_block, dest_idx), &payload)?;
                    let tentative = encode_tentative(l);
                    self.write_words(
                        self.geo.entry_address(dest_block, dest_idx),
                        &[tentative],
                    )?;
                    self.retire_entry(victim, idx)?;
                    self.write_words(
                        self.geo.entry_address(dest_block, dest_idx),
                        &[commit_word(tentative)],
                    )?;
                    moved_out += 1;
                    garbage += 1;
                }
                EntryState::Obsolete => garbage += 1,
                EntryState::Free if !bit_free => garbage += 1,
                EntryState::Free => {}
                EntryState::Tentative(_) | EntryState::Malformed => {
                    // Runtime media never holds these; open resolves them.
                    self.diag
                        .record_system_error(SystemErrorCode::MappingInconsistent);
                    self.driver
                        .system_error(SystemErrorCode::MappingInconsistent);
                    garbage += 1;
                }
            }
        }
        if garbage == 0 {
            return Ok(false);
        }
        trace!(
            "{}: moved {} live sectors out of block {}",
            self.name,
            moved_out,
            victim.as_u16()
        );

        let new_count = (victim_count + 1).min(HEADER_COUNT_MASK);
        self.erase_block(victim, new_count)?;
        self.free_sectors += garbage;
        self.obsolete_sectors = self.obsolete_sectors.saturating_sub(garbage);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Mount

    fn mount(&mut self) -> Result<(), NorFtlError<F::Error>> {
        // Validate every header before touching anything.
        let mut formatted = 0u32;
        let mut erase_sum = 0u64;
        for b in 0..self.geo.block_count {
            let block = BlockIndex::new(b as u16);
            match decode_header(self.read_word(self.geo.header_address(block))?) {
                BlockHeader::Formatted(c) => {
                    formatted += 1;
                    erase_sum += c as u64;
                }
                BlockHeader::Unformatted => {}
                BlockHeader::Corrupt => {
                    error!("{}: block {} header unrecognized", self.name, block.as_u16());
                    self.diag.record_system_error(SystemErrorCode::InvalidFormat);
                    self.driver.system_error(SystemErrorCode::InvalidFormat);
                    return Err(NorFtlError::InvalidFormat);
                }
            }
        }
        if formatted == 0 {
            error!("{}: media is not formatted", self.name);
            return Err(NorFtlError::InvalidFormat);
        }
        let mean_count = (erase_sum / formatted as u64) as u32;

        // Finish interrupted erases: an all-ones header means the block was
        // mid-reclaim when power went away. Its exact erase count is lost;
        // the mean keeps wear leveling sane.
        for b in 0..self.geo.block_count {
            let block = BlockIndex::new(b as u16);
            if decode_header(self.read_word(self.geo.header_address(block))?)
                != BlockHeader::Unformatted
            {
                continue;
            }
            debug!("{}: completing interrupted erase of block {}", self.name, block.as_u16());
            let erased = self
                .driver
                .block_erased_verify(block)
                .map_err(NorFtlError::Flash)?;
            if erased {
                // Only the header rewrite was lost.
                self.write_words(self.geo.header_address(block), &[encode_header(mean_count)])?;
            } else {
                self.erase_block(block, mean_count)?;
            }
        }

        // Tally sectors and remember whether any update was in flight.
        let mut tentatives = 0u32;
        for b in 0..self.geo.block_count {
            let block = BlockIndex::new(b as u16);
            let summary = self.scan_block(block)?;
            if summary.malformed > 0 {
                error!("{}: block {} holds malformed entries", self.name, block.as_u16());
                self.diag.record_system_error(SystemErrorCode::InvalidFormat);
                self.driver.system_error(SystemErrorCode::InvalidFormat);
                return Err(NorFtlError::InvalidFormat);
            }
            self.free_sectors += summary.free;
            self.mapped_sectors += summary.live;
            self.obsolete_sectors += summary.garbage;
            tentatives += summary.tentative;
        }

        // Resolve in-flight updates: a tentative copy loses to a live
        // sibling and is promoted when it has none (the old copy was
        // already retired, so the data it carries is the newest).
        if tentatives > 0 {
            for b in 0..self.geo.block_count {
                let block = BlockIndex::new(b as u16);
                for idx in 0..self.geo.sectors_per_block {
                    let EntryState::Tentative(l) = self.entry_state(block, idx)? else {
                        continue;
                    };
                    let addr = self.geo.entry_address(block, idx);
                    let entry = self.read_word(addr)?;
                    if self
                        .find_live_on_media(LogicalSector::new(l as u32))?
                        .is_some()
                    {
                        debug!("{}: rolling back interrupted update of sector {}", self.name, l);
                        self.write_words(addr, &[retire_word(entry)])?;
                        self.obsolete_sectors += 1;
                    } else {
                        debug!("{}: completing interrupted update of sector {}", self.name, l);
                        self.write_words(addr, &[commit_word(entry)])?;
                        self.mapped_sectors += 1;
                    }
                }
            }
        }

        info!(
            "{}: mounted, {} blocks / {} free / {} mapped / {} obsolete sectors",
            self.name, self.geo.block_count, self.free_sectors, self.mapped_sectors,
            self.obsolete_sectors
        );
        Ok(())
    }

    fn scan_block(&mut self, block: BlockIndex) -> Result<BlockSummary, NorFtlError<F::Error>> {
        let bits = self.free_bits(block)?;
        let mut summary = BlockSummary::default();
        for idx in 0..self.geo.sectors_per_block {
            let bit_free = bits[(idx >> 5) as usize] & (1 << (idx & 31)) != 0;
            match self.entry_state(block, idx)? {
                EntryState::Free if bit_free => summary.free += 1,
                // Claimed but never mapped: a torn allocation.
                EntryState::Free => summary.garbage += 1,
                EntryState::Live(_) => summary.live += 1,
                EntryState::Obsolete => summary.garbage += 1,
                EntryState::Tentative(_) => summary.tentative += 1,
                EntryState::Malformed => summary.malformed += 1,
            }
        }
        Ok(summary)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BlockSummary {
    free: u32,
    live: u32,
    garbage: u32,
    tentative: u32,
    malformed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftl_core::test::VirtualNorFlash;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::boxed::Box;
    use std::vec;
    use std::vec::Vec;

    // Adds logging to the test automatically
    // control with RUST_LOG="LEVEL"
    // requires --features log passed to cargo test
    use test_log::test;

    const W: usize = 16;
    // 1 header + 1 free-bitmap word + 16 entries + 16 * 16 payload words
    const WPB: usize = 274;
    type Flash = VirtualNorFlash<WPB, 16>;
    type Ftl = NorFtl<Flash, W>;
    type SmallFlash = VirtualNorFlash<WPB, 4>;
    type SmallFtl = NorFtl<SmallFlash, W>;

    fn payload(tag: u32) -> [u32; W] {
        core::array::from_fn(|i| tag ^ (i as u32).wrapping_mul(0x9E37_79B9))
    }

    fn fresh() -> Ftl {
        Ftl::format(Flash::new(), "nor-test").unwrap()
    }

    fn ls(n: u32) -> LogicalSector {
        LogicalSector::new(n)
    }

    #[test]
    fn format_write_read() {
        let mut ftl = fresh();
        assert_eq!(ftl.logical_sectors(), 240);
        assert_eq!(ftl.capacity(), 240);
        assert_eq!(ftl.free_sectors(), 256);
        ftl.sector_write(ls(0), &payload(0xA1)).unwrap();
        let mut buf = [0u32; W];
        ftl.sector_read(ls(0), &mut buf).unwrap();
        assert_eq!(buf, payload(0xA1));
        assert_eq!(ftl.mapped_sectors(), 1);
    }

    #[test]
    fn read_unwritten_sector() {
        let mut ftl = fresh();
        let mut buf = [0u32; W];
        assert!(matches!(
            ftl.sector_read(ls(7), &mut buf),
            Err(NorFtlError::SectorNotFound)
        ));
    }

    #[test]
    fn argument_validation() {
        let mut ftl = fresh();
        let mut short = [0u32; W - 1];
        assert!(matches!(
            ftl.sector_read(ls(0), &mut short),
            Err(NorFtlError::InvalidWrite)
        ));
        assert!(matches!(
            ftl.sector_write(ls(0), &short),
            Err(NorFtlError::InvalidWrite)
        ));
        let mut buf = [0u32; W];
        assert!(matches!(
            ftl.sector_read(ls(240), &mut buf),
            Err(NorFtlError::InvalidSector)
        ));
        assert!(matches!(
            ftl.sector_write(ls(999), &buf),
            Err(NorFtlError::InvalidSector)
        ));
        assert!(matches!(
            ftl.sector_release(ls(240)),
            Err(NorFtlError::InvalidSector)
        ));
    }

    #[test]
    fn update_supersedes_old_copy() {
        let mut ftl = fresh();
        ftl.sector_write(ls(3), &payload(0xAA)).unwrap();
        ftl.sector_write(ls(3), &payload(0xBB)).unwrap();
        let mut buf = [0u32; W];
        ftl.sector_read(ls(3), &mut buf).unwrap();
        assert_eq!(buf, payload(0xBB));
        assert_eq!(ftl.mapped_sectors(), 1);
        assert_eq!(ftl.obsolete_sectors(), 1);
    }

    #[test]
    fn release_removes_mapping() {
        let mut ftl = fresh();
        ftl.sector_write(ls(9), &payload(1)).unwrap();
        ftl.sector_release(ls(9)).unwrap();
        let mut buf = [0u32; W];
        assert!(matches!(
            ftl.sector_read(ls(9), &mut buf),
            Err(NorFtlError::SectorNotFound)
        ));
        assert!(matches!(
            ftl.sector_release(ls(9)),
            Err(NorFtlError::SectorNotFound)
        ));
        assert_eq!(ftl.obsolete_sectors(), 1);
    }

    #[test]
    fn state_survives_remount() {
        let mut ftl = fresh();
        for i in 0..10 {
            ftl.sector_write(ls(i), &payload(i)).unwrap();
        }
        ftl.sector_release(ls(4)).unwrap();
        let (free, mapped, obsolete) = (
            ftl.free_sectors(),
            ftl.mapped_sectors(),
            ftl.obsolete_sectors(),
        );
        let flash = ftl.into_driver();
        let mut ftl = Ftl::open(flash, "nor-test").unwrap();
        assert_eq!(ftl.free_sectors(), free);
        assert_eq!(ftl.mapped_sectors(), mapped);
        assert_eq!(ftl.obsolete_sectors(), obsolete);
        let mut buf = [0u32; W];
        for i in 0..10 {
            if i == 4 {
                assert!(ftl.sector_read(ls(i), &mut buf).is_err());
            } else {
                ftl.sector_read(ls(i), &mut buf).unwrap();
                assert_eq!(buf, payload(i));
            }
        }
    }

    #[test]
    fn open_refuses_unformatted_media() {
        assert!(matches!(
            Ftl::open(Flash::new(), "nor-test"),
            Err(NorFtlError::InvalidFormat)
        ));
    }

    #[test]
    fn open_refuses_corrupt_header() {
        let ftl = fresh();
        let mut flash = ftl.close();
        flash.set_raw_word(ftl_core::BlockIndex::new(2), 0, 0x1BAD_F00D);
        assert!(matches!(
            Ftl::open(flash, "nor-test"),
            Err(NorFtlError::InvalidFormat)
        ));
    }

    #[test]
    fn fill_release_and_rewrite_reclaims() {
        let mut ftl = fresh();
        for i in 0..240 {
            ftl.sector_write(ls(i), &payload(i)).unwrap();
        }
        // Free pool is down to exactly one block's worth now.
        for i in (1..240).step_by(2) {
            ftl.sector_release(ls(i)).unwrap();
        }
        ftl.sector_write(ls(1), &payload(0xF00D)).unwrap();
        let mut buf = [0u32; W];
        ftl.sector_read(ls(1), &mut buf).unwrap();
        assert_eq!(buf, payload(0xF00D));
        ftl.sector_read(ls(0), &mut buf).unwrap();
        assert_eq!(buf, payload(0));
        assert!(ftl.diagnostics().reclaims > 0);
    }

    #[test]
    fn full_medium_still_updates() {
        let mut ftl = fresh();
        for i in 0..240 {
            ftl.sector_write(ls(i), &payload(i)).unwrap();
        }
        // Updating existing sectors still works (it frees its own garbage
        // through reclaim)...
        ftl.sector_write(ls(0), &payload(0x42)).unwrap();
        // ...and the medium keeps all live data intact.
        let mut buf = [0u32; W];
        ftl.sector_read(ls(239), &mut buf).unwrap();
        assert_eq!(buf, payload(239));
    }

    #[test]
    fn defragment_compacts_all_garbage() {
        let mut ftl = fresh();
        for i in 0..32 {
            ftl.sector_write(ls(i), &payload(i)).unwrap();
        }
        for i in 0..32 {
            ftl.sector_release(ls(i)).unwrap();
        }
        assert!(ftl.obsolete_sectors() >= 32 - 16);
        ftl.defragment().unwrap();
        assert_eq!(ftl.obsolete_sectors(), 0);
        assert_eq!(ftl.free_sectors(), 256);
    }

    #[test]
    fn reclaim_recovers_a_blocks_worth() {
        let mut ftl = fresh();
        // One fully-obsolete block's worth of garbage...
        for i in 0..16 {
            ftl.sector_write(ls(i), &payload(i)).unwrap();
        }
        for i in 0..16 {
            ftl.sector_release(ls(i)).unwrap();
        }
        let free_before = ftl.free_sectors();
        ftl.partial_defragment(1).unwrap();
        // ...is recovered by a bounded number of passes (here one).
        assert!(ftl.free_sectors() >= free_before + 16);
    }

    #[test]
    fn batch_write_and_read() {
        let mut ftl = fresh();
        let mut data = [0u32; W * 5];
        for (i, chunk) in data.chunks_exact_mut(W).enumerate() {
            chunk.copy_from_slice(&payload(0x1000 + i as u32));
        }
        ftl.sectors_write(ls(20), &data).unwrap();
        let mut back = [0u32; W * 5];
        ftl.sectors_read(ls(20), &mut back).unwrap();
        assert_eq!(data, back);
        // Ragged buffers are rejected.
        let ragged = [0u32; W + 1];
        assert!(matches!(
            ftl.sectors_write(ls(0), &ragged),
            Err(NorFtlError::InvalidWrite)
        ));
    }

    #[test]
    fn batch_write_halts_at_capacity_edge() {
        let mut ftl = fresh();
        let data = [7u32; W * 4];
        // Sectors 238, 239 are valid, 240 is not: the batch persists the
        // prefix and reports the failure.
        let err = ftl.sectors_write(ls(238), &data).unwrap_err();
        assert!(matches!(err, NorFtlError::InvalidSector));
        let mut buf = [0u32; W];
        ftl.sector_read(ls(238), &mut buf).unwrap();
        assert_eq!(buf, [7u32; W]);
        ftl.sector_read(ls(239), &mut buf).unwrap();
        assert_eq!(buf, [7u32; W]);
    }

    #[test]
    fn crash_consistency_sweep() {
        let a = payload(0xAAAA);
        let b = payload(0xBBBB);

        // Measure the word budget of an overwrite.
        let mut ftl = fresh();
        ftl.sector_write(ls(0), &a).unwrap();
        let before = ftl.driver().word_writes();
        ftl.sector_write(ls(0), &b).unwrap();
        let budget = ftl.driver().word_writes() - before;

        for cut in 0..=budget {
            let mut ftl = fresh();
            ftl.sector_write(ls(0), &a).unwrap();
            ftl.driver_mut().power_cut_after(cut);
            let _ = ftl.sector_write(ls(0), &b);
            let mut flash = ftl.close();
            flash.power_restore();

            let mut ftl = Ftl::open(flash, "nor-test").unwrap();
            let mut buf = [0u32; W];
            ftl.sector_read(ls(0), &mut buf).unwrap();
            assert!(buf == a || buf == b, "torn payload at cut {}", cut);
            if cut == 0 {
                assert_eq!(buf, a, "nothing was written yet");
            }
            if cut == budget {
                assert_eq!(buf, b, "the whole update went through");
            }

            // Exactly one live mapping: releasing once removes the sector.
            ftl.sector_release(ls(0)).unwrap();
            assert!(matches!(
                ftl.sector_read(ls(0), &mut buf),
                Err(NorFtlError::SectorNotFound)
            ));

            // The engine is still fully usable after recovery.
            ftl.sector_write(ls(0), &payload(0xCC)).unwrap();
            ftl.sector_read(ls(0), &mut buf).unwrap();
            assert_eq!(buf, payload(0xCC));
        }
    }

    #[test]
    fn crash_during_reclaim_sweep() {
        // Budget measurement: fill a small device, punch holes, defragment.
        let setup = |ftl: &mut SmallFtl| {
            for i in 0..48 {
                ftl.sector_write(ls(i), &payload(i)).unwrap();
            }
            for i in (1..48).step_by(2) {
                ftl.sector_release(ls(i)).unwrap();
            }
        };
        let mut ftl = SmallFtl::format(SmallFlash::new(), "nor-test").unwrap();
        setup(&mut ftl);
        let before = ftl.driver().word_writes();
        ftl.defragment().unwrap();
        let budget = ftl.driver().word_writes() - before;

        for cut in 0..=budget {
            let mut ftl = SmallFtl::format(SmallFlash::new(), "nor-test").unwrap();
            setup(&mut ftl);
            ftl.driver_mut().power_cut_after(cut);
            let _ = ftl.defragment();
            let mut flash = ftl.close();
            flash.power_restore();

            let mut ftl = SmallFtl::open(flash, "nor-test").unwrap();
            let mut buf = [0u32; W];
            for i in 0..48 {
                if i % 2 == 1 && i != 0 {
                    assert!(
                        ftl.sector_read(ls(i), &mut buf).is_err(),
                        "released sector {} reappeared at cut {}",
                        i,
                        cut
                    );
                } else {
                    ftl.sector_read(ls(i), &mut buf).unwrap();
                    assert_eq!(buf, payload(i), "sector {} lost at cut {}", i, cut);
                }
            }
        }
    }

    #[test]
    fn wear_leveling_stays_balanced() {
        let mut ftl = fresh();
        for i in 0..10_000u32 {
            ftl.sector_write(ls(0), &payload(i)).unwrap();
        }
        let flash = ftl.close();
        let counts: Vec<u32> = (0..16)
            .map(|b| flash.erase_ops(ftl_core::BlockIndex::new(b)))
            .collect();
        let mean = counts.iter().sum::<u32>() as f64 / counts.len() as f64;
        for (b, &c) in counts.iter().enumerate() {
            assert!(
                (c as f64 - mean).abs() <= 2.0,
                "block {} erased {} times, mean {}",
                b,
                c,
                mean
            );
        }
    }

    #[test]
    fn extended_cache_serves_hits_and_survives_reclaim() {
        let mut ftl = fresh();
        let lines = Box::leak(vec![CacheLine::<W>::EMPTY; 4].into_boxed_slice());
        ftl.extended_cache_enable(lines);

        ftl.sector_write(ls(5), &payload(0x58)).unwrap();
        let mut buf = [0u32; W];
        ftl.sector_read(ls(5), &mut buf).unwrap();
        // Second read is served from the cache: no media words touched.
        let reads = ftl.driver().word_reads();
        ftl.sector_read(ls(5), &mut buf).unwrap();
        assert_eq!(ftl.driver().word_reads(), reads);
        assert_eq!(buf, payload(0x58));

        // Make the hosting block the reclaim victim and erase it under the
        // cache's feet.
        for i in 6..21 {
            ftl.sector_write(ls(i), &payload(i)).unwrap();
        }
        for i in 6..21 {
            ftl.sector_release(ls(i)).unwrap();
        }
        ftl.partial_defragment(1).unwrap();
        ftl.sector_read(ls(5), &mut buf).unwrap();
        assert_eq!(buf, payload(0x58));
    }

    #[test]
    fn randomized_against_mirror_with_all_caches() {
        let mut ftl = fresh();
        let lines = Box::leak(vec![CacheLine::<W>::EMPTY; 4].into_boxed_slice());
        ftl.extended_cache_enable(lines);
        let words = Box::leak(vec![0u32; 8].into_boxed_slice());
        ftl.mapping_bitmap_enable(words).unwrap();
        let counts = Box::leak(vec![0u16; 16].into_boxed_slice());
        ftl.obsolete_count_cache_enable(counts).unwrap();

        let mut mirror: Vec<Option<[u32; W]>> = vec![None; 240];
        let mut rng = SmallRng::seed_from_u64(0x5EED);
        for step in 0..2_000u32 {
            let l = rng.gen_range(0..240u32);
            match rng.gen_range(0..10) {
                0..=4 => {
                    let data = payload(step.wrapping_mul(31) ^ l);
                    ftl.sector_write(ls(l), &data).unwrap();
                    mirror[l as usize] = Some(data);
                }
                5..=6 => match ftl.sector_release(ls(l)) {
                    Ok(()) => {
                        assert!(mirror[l as usize].is_some());
                        mirror[l as usize] = None;
                    }
                    Err(NorFtlError::SectorNotFound) => {
                        assert!(mirror[l as usize].is_none());
                    }
                    Err(e) => panic!("release failed: {:?}", e),
                },
                7 if step % 97 == 0 => ftl.partial_defragment(2).unwrap(),
                _ => {
                    let mut buf = [0u32; W];
                    match ftl.sector_read(ls(l), &mut buf) {
                        Ok(()) => assert_eq!(Some(buf), mirror[l as usize]),
                        Err(NorFtlError::SectorNotFound) => {
                            assert!(mirror[l as usize].is_none())
                        }
                        Err(e) => panic!("read failed: {:?}", e),
                    }
                }
            }
        }
        // Everything the mirror holds must survive a remount.
        let flash = ftl.close();
        let mut ftl = Ftl::open(flash, "nor-test").unwrap();
        let mut buf = [0u32; W];
        for (l, entry) in mirror.iter().enumerate() {
            match entry {
                Some(data) => {
                    ftl.sector_read(ls(l as u32), &mut buf).unwrap();
                    assert_eq!(buf, *data);
                }
                None => assert!(ftl.sector_read(ls(l as u32), &mut buf).is_err()),
            }
        }
    }

    #[test]
    fn diagnostics_count_operations() {
        let mut ftl = fresh();
        ftl.sector_write(ls(0), &payload(1)).unwrap();
        ftl.sector_write(ls(0), &payload(2)).unwrap();
        let mut buf = [0u32; W];
        ftl.sector_read(ls(0), &mut buf).unwrap();
        ftl.sector_release(ls(0)).unwrap();
        let diag = ftl.diagnostics();
        assert_eq!(diag.write_requests, 2);
        assert_eq!(diag.read_requests, 1);
        assert_eq!(diag.releases, 1);
        assert_eq!(diag.system_errors, 0);
    }
}
