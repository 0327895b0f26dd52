#![no_std]

mod address;
mod fmt;
pub mod cache;
pub use address::{BlockIndex, ByteAddress, LogicalSector, PageIndex, WordAddress};

pub trait FlashError {
    /// Convert a specific flash error into a generic error kind
    fn kind(&self) -> FlashErrorKind;
}

/// A trait that driver implementations can use to share an error type.
pub trait ErrorType {
    /// Errors returned by this flash device.
    type Error: FlashError + core::fmt::Debug;
}

/// Flash error kinds.
///
/// Driver implementations must map their errors to these generic kinds
/// through the [`FlashError`] trait so the translation layer can decide
/// between retiring a block, logging a degradation, or giving up.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum FlashErrorKind {
    /// The arguments are not properly aligned.
    NotAligned,

    /// The arguments are out of bounds.
    OutOfBounds,

    /// The operation succeeded but ECC had to correct the data read.
    /// The destination buffer holds corrected, valid data.
    Corrected,

    /// A program (write) operation failed; the target page/word did not
    /// take the data. The containing block should be retired.
    ProgramFail,

    /// A block erase failed. The block must be marked bad.
    EraseFail,

    /// The operation targeted a block already marked bad.
    BadBlock,

    /// Error specific to the implementation.
    Other,
}

/// Good/bad latch of a block, as reported by the device's factory markers
/// and runtime bad-block bookkeeping. The transition GOOD → BAD is
/// irreversible; drivers are expected to store the marker redundantly.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum BlockStatus {
    Good,
    Bad,
}

impl BlockStatus {
    pub fn is_good(&self) -> bool {
        matches!(self, BlockStatus::Good)
    }
}

/// Diagnostic codes forwarded to the driver's `system_error` hook and
/// recorded in [`Diagnostics`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum SystemErrorCode {
    /// A driver read returned an error other than a corrected ECC read
    DriverRead,
    /// A driver write/program failed
    DriverWrite,
    /// A driver erase failed
    DriverErase,
    /// A block did not verify as erased after an erase
    EraseVerify,
    /// ECC corrected a read; the medium is degrading at that location
    EccCorrected,
    /// The on-media structures do not decode as a recognized layout
    InvalidFormat,
    /// The on-media structures decode but violate an invariant
    MappingInconsistent,
    /// The block list ran out of room (mapped region met the free region)
    ListOverflow,
}

/// Operation counters and most-recent-fault records kept by each engine.
#[derive(Debug, Default, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Diagnostics {
    pub read_requests: u32,
    pub write_requests: u32,
    pub releases: u32,
    pub reclaims: u32,
    pub block_erases: u32,
    pub system_errors: u32,
    pub last_system_error: Option<SystemErrorCode>,
    pub corrected_reads: u32,
    /// Block and page of the most recent ECC-corrected read
    pub last_corrected: Option<(u16, u16)>,
}

impl Diagnostics {
    pub fn record_system_error(&mut self, code: SystemErrorCode) {
        self.system_errors += 1;
        self.last_system_error = Some(code);
    }

    pub fn record_corrected(&mut self, block: u16, page: u16) {
        self.corrected_reads += 1;
        self.last_corrected = Some((block, page));
    }
}

/// Word-addressed NOR flash driver.
///
/// Writes may only clear bits (1 → 0); setting a programmed bit back to 1
/// without a block erase is undefined behavior on the medium, and the
/// engine never asks for it. Calls are synchronous and single-threaded per
/// device.
pub trait NorFlashDriver: ErrorType {
    /// 32-bit words per erase block, including engine metadata words
    const WORDS_PER_BLOCK: usize;

    /// Number of erase blocks
    const BLOCK_COUNT: usize;

    /// Read `dest.len()` words starting at `address`.
    fn read(&mut self, address: WordAddress, dest: &mut [u32]) -> Result<(), Self::Error>;

    /// Program `src.len()` words starting at `address`. Only 1 → 0
    /// transitions; a word write is atomic with respect to power loss.
    fn write(&mut self, address: WordAddress, src: &[u32]) -> Result<(), Self::Error>;

    /// Erase a block, resetting every word to all-ones. `erase_count` is
    /// the new lifetime erase total for the block, for drivers that track
    /// wear on the side.
    fn block_erase(&mut self, block: BlockIndex, erase_count: u32) -> Result<(), Self::Error>;

    /// Check that a block reads back as fully erased.
    fn block_erased_verify(&mut self, block: BlockIndex) -> Result<bool, Self::Error> {
        let base = block.as_word_address(Self::WORDS_PER_BLOCK as u32);
        let mut word = [0u32; 1];
        for offset in 0..Self::WORDS_PER_BLOCK as u32 {
            self.read(base + offset, &mut word)?;
            if word[0] != 0xFFFF_FFFF {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Diagnostic notification; the engine reports faults here in addition
    /// to its own bookkeeping.
    fn system_error(&mut self, _code: SystemErrorCode) {}

    /// The capacity of the device in words.
    fn capacity_words(&self) -> u32 {
        (Self::WORDS_PER_BLOCK * Self::BLOCK_COUNT) as u32
    }
}

/// Page-programmed NAND flash driver with a spare/OOB area per page.
///
/// ECC over the main area is the driver's responsibility: reads return
/// [`FlashErrorKind::Corrected`] when ECC repaired the data (the buffer is
/// valid) and an uncorrectable read surfaces as `ProgramFail`/`Other`.
/// Spare-area writes may be issued more than once per page (status-byte
/// updates); drivers must support the partial-program budget of SLC media.
pub trait NandFlashDriver: ErrorType {
    /// Main-area bytes per page
    const PAGE_SIZE: usize;

    /// Spare/OOB bytes per page
    const SPARE_SIZE: usize;

    /// Pages per erase block
    const PAGES_PER_BLOCK: usize;

    /// Number of erase blocks
    const BLOCK_COUNT: usize;

    /// Read a page's main area into `dest` (`PAGE_SIZE` bytes).
    fn page_read(
        &mut self,
        block: BlockIndex,
        page: PageIndex,
        dest: &mut [u8],
    ) -> Result<(), Self::Error>;

    /// Program a page's main area and spare area in a single operation.
    /// `spare` may be shorter than `SPARE_SIZE`; remaining bytes are left
    /// unprogrammed (all-ones).
    fn page_write(
        &mut self,
        block: BlockIndex,
        page: PageIndex,
        src: &[u8],
        spare: &[u8],
    ) -> Result<(), Self::Error>;

    /// Read a page's spare area into `dest`.
    fn spare_read(
        &mut self,
        block: BlockIndex,
        page: PageIndex,
        dest: &mut [u8],
    ) -> Result<(), Self::Error>;

    /// Program bytes of a page's spare area (1 → 0 transitions only,
    /// all-ones source bytes leave cells untouched).
    fn spare_write(
        &mut self,
        block: BlockIndex,
        page: PageIndex,
        src: &[u8],
    ) -> Result<(), Self::Error>;

    /// Copy a page (main + spare) to another location, using the device's
    /// internal move operation where available. ECC must be applied.
    fn page_copy(
        &mut self,
        src_block: BlockIndex,
        src_page: PageIndex,
        dest_block: BlockIndex,
        dest_page: PageIndex,
    ) -> Result<(), Self::Error>;

    /// Read `dest.len() / PAGE_SIZE` sequential pages starting at `first`.
    fn pages_read(
        &mut self,
        block: BlockIndex,
        first: PageIndex,
        dest: &mut [u8],
    ) -> Result<(), Self::Error> {
        for (i, chunk) in dest.chunks_exact_mut(Self::PAGE_SIZE).enumerate() {
            self.page_read(block, first + i as u16, chunk)?;
        }
        Ok(())
    }

    /// Program `src.len() / PAGE_SIZE` sequential pages starting at
    /// `first`, leaving their spare areas unprogrammed.
    fn pages_write(
        &mut self,
        block: BlockIndex,
        first: PageIndex,
        src: &[u8],
    ) -> Result<(), Self::Error> {
        for (i, chunk) in src.chunks_exact(Self::PAGE_SIZE).enumerate() {
            self.page_write(block, first + i as u16, chunk, &[])?;
        }
        Ok(())
    }

    /// Copy `count` sequential pages between blocks.
    fn pages_copy(
        &mut self,
        src_block: BlockIndex,
        src_first: PageIndex,
        dest_block: BlockIndex,
        dest_first: PageIndex,
        count: u16,
    ) -> Result<(), Self::Error> {
        for i in 0..count {
            self.page_copy(src_block, src_first + i, dest_block, dest_first + i)?;
        }
        Ok(())
    }

    /// Erase a block. `erase_count` is the new lifetime erase total.
    fn block_erase(&mut self, block: BlockIndex, erase_count: u32) -> Result<(), Self::Error>;

    /// Check that a block reads back as fully erased (main and spare).
    fn block_erased_verify(&mut self, block: BlockIndex) -> Result<bool, Self::Error>;

    /// Check that a single page (main area) reads back as erased. Used to
    /// detect programs torn by power loss before any spare byte was
    /// written.
    fn page_erased_verify(
        &mut self,
        block: BlockIndex,
        page: PageIndex,
    ) -> Result<bool, Self::Error>;

    /// Query the good/bad latch for a block.
    fn block_status_get(&mut self, block: BlockIndex) -> Result<BlockStatus, Self::Error>;

    /// Set the good/bad latch for a block. Drivers write the marker
    /// redundantly so one corrupted spare area cannot lose it.
    fn block_status_set(
        &mut self,
        block: BlockIndex,
        status: BlockStatus,
    ) -> Result<(), Self::Error>;

    /// Diagnostic notification with the fault location when known.
    fn system_error(
        &mut self,
        _code: SystemErrorCode,
        _block: Option<BlockIndex>,
        _page: Option<PageIndex>,
    ) {
    }

    /// The capacity of the device in main-area bytes.
    fn capacity_bytes(&self) -> u32 {
        (Self::PAGE_SIZE * Self::PAGES_PER_BLOCK * Self::BLOCK_COUNT) as u32
    }
}

/// Return whether a logical range `[start, start + count)` stays inside a
/// device exposing `total` logical sectors.
pub fn check_logical_range(start: LogicalSector, count: u32, total: u32) -> bool {
    let s = start.as_u32();
    s < total && count <= total - s
}

/// Return whether a host buffer length is an exact multiple of the sector
/// size, and how many sectors it covers.
pub fn sector_count_for_len(len: usize, sector_len: usize) -> Option<u32> {
    if sector_len == 0 || len == 0 || len % sector_len != 0 {
        return None;
    }
    Some((len / sector_len) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_range_check() {
        assert!(check_logical_range(LogicalSector::new(0), 10, 10));
        assert!(check_logical_range(LogicalSector::new(9), 1, 10));
        assert!(!check_logical_range(LogicalSector::new(9), 2, 10));
        assert!(!check_logical_range(LogicalSector::new(10), 1, 10));
        assert!(!check_logical_range(LogicalSector::new(10), 0, 10));
    }

    #[test]
    fn sector_count() {
        assert_eq!(sector_count_for_len(512, 512), Some(1));
        assert_eq!(sector_count_for_len(1536, 512), Some(3));
        assert_eq!(sector_count_for_len(100, 512), None);
        assert_eq!(sector_count_for_len(0, 512), None);
    }
}
