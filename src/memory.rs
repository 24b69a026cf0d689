//! Simulated user memory.
//!
//! An [`AddressSpace`] maps page-granular address ranges onto [`MemoryObject`]s. A private mapping
//! owns an anonymous object; a shared mapping references an object that other spaces may map at
//! different addresses. Pages of an object are faulted in on first touch.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::Ordering::{Relaxed, SeqCst};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize};
use std::sync::{Arc, OnceLock};

use log::trace;

use crate::error::Error;
use crate::lock_api::RwLock;
use crate::opcode::WakeOp;

/// Size of a page.
pub const PAGE_SIZE: usize = 4096;

/// Size of a futex word.
const WORD_SIZE: usize = size_of::<u32>();

/// Address of the first mapping of every space; everything below stays unmapped.
const FIRST_MAPPING: usize = 0x1_0000;

/// Identity source of address spaces.
static SPACE_IDS: AtomicU64 = AtomicU64::new(1);

/// Identity source of memory objects; never reused.
static OBJECT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Identity of an [`AddressSpace`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SpaceId(u64);

/// Backing storage that one or more mappings refer to.
pub struct MemoryObject {
    /// Lazily faulted pages.
    pages: Box<[OnceLock<Box<[AtomicU32]>>]>,
    /// Identity assigned the first time the object backs a shared key.
    sequence: OnceLock<u64>,
}

/// An address space.
pub struct AddressSpace {
    /// Identity of the space.
    id: SpaceId,
    /// Mappings keyed by their start address.
    regions: RwLock<BTreeMap<usize, Region>>,
    /// Start address of the next mapping.
    next_address: AtomicUsize,
}

/// A mapped range.
#[derive(Debug)]
struct Region {
    len: usize,
    object: Arc<MemoryObject>,
    offset: usize,
    shared: bool,
}

/// Where an address lands.
#[derive(Debug)]
pub(crate) struct Location {
    pub(crate) object: Arc<MemoryObject>,
    pub(crate) offset: usize,
    pub(crate) shared: bool,
}

impl MemoryObject {
    /// Creates a zero-filled object of at least `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Arc<Self> {
        let pages = len.div_ceil(PAGE_SIZE).max(1);
        Arc::new(Self {
            pages: (0..pages).map(|_| OnceLock::new()).collect(),
            sequence: OnceLock::new(),
        })
    }

    /// Returns the size of the object in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// Returns the identity of the object, assigning one on first use.
    pub(crate) fn sequence(&self) -> u64 {
        *self
            .sequence
            .get_or_init(|| OBJECT_SEQUENCE.fetch_add(1, Relaxed))
    }

    /// Faults in the page containing `offset`.
    pub(crate) fn fault_in(&self, offset: usize) -> Option<&[AtomicU32]> {
        let page = self.pages.get(offset / PAGE_SIZE)?;
        Some(page.get_or_init(|| {
            trace!("fault in page {} of object {:p}", offset / PAGE_SIZE, self);
            (0..PAGE_SIZE / WORD_SIZE).map(|_| AtomicU32::new(0)).collect()
        }))
    }

    fn word(&self, offset: usize) -> Option<&AtomicU32> {
        self.fault_in(offset)?.get((offset % PAGE_SIZE) / WORD_SIZE)
    }
}

impl fmt::Debug for MemoryObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryObject")
            .field("size", &self.size())
            .field("sequence", &self.sequence.get())
            .finish_non_exhaustive()
    }
}

impl AddressSpace {
    /// Creates an empty address space.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: SpaceId(SPACE_IDS.fetch_add(1, Relaxed)),
            regions: RwLock::new(BTreeMap::new()),
            next_address: AtomicUsize::new(FIRST_MAPPING),
        })
    }

    /// Returns the identity of the space.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Maps `len` bytes of fresh anonymous memory and returns the start address.
    ///
    /// # Examples
    ///
    /// ```
    /// use futex_engine::AddressSpace;
    ///
    /// let space = AddressSpace::new();
    /// let address = space.map_private(64);
    /// assert_eq!(space.load(address), Ok(0));
    /// ```
    #[must_use]
    pub fn map_private(&self, len: usize) -> usize {
        self.map(MemoryObject::new(len), 0, len, false)
    }

    /// Maps `len` bytes of `object` starting at `offset` and returns the start address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `offset` is not page aligned or the range exceeds
    /// the object.
    pub fn map_shared(
        &self,
        object: &Arc<MemoryObject>,
        offset: usize,
        len: usize,
    ) -> Result<usize, Error> {
        if offset % PAGE_SIZE != 0
            || offset
                .checked_add(len)
                .is_none_or(|end| end > object.size())
        {
            return Err(Error::InvalidArgument);
        }
        Ok(self.map(object.clone(), offset, len, true))
    }

    /// Removes the mapping starting at `address`; returns `false` if no mapping starts there.
    #[must_use]
    pub fn unmap(&self, address: usize) -> bool {
        self.regions.write().remove(&address).is_some()
    }

    /// Loads the word at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a misaligned address and [`Error::Fault`] for an
    /// unmapped one.
    pub fn load(&self, address: usize) -> Result<u32, Error> {
        self.with_word(address, |word| word.load(SeqCst))
    }

    /// Stores `value` at `address`.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::load`].
    pub fn store(&self, address: usize, value: u32) -> Result<(), Error> {
        self.with_word(address, |word| word.store(value, SeqCst))
    }

    /// Replaces the word at `address` with `new` if it holds `current`, and returns the value it
    /// held; the exchange happened if the returned value equals `current`.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::load`].
    pub fn compare_exchange(&self, address: usize, current: u32, new: u32) -> Result<u32, Error> {
        self.with_word(address, |word| {
            match word.compare_exchange(current, new, SeqCst, SeqCst) {
                Ok(previous) | Err(previous) => previous,
            }
        })
    }

    /// Loads a pointer-sized little-endian value made of two words.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] unless `address` is 8-byte aligned, and
    /// [`Error::Fault`] if it is unmapped.
    pub fn load_u64(&self, address: usize) -> Result<u64, Error> {
        if address % size_of::<u64>() != 0 {
            return Err(Error::InvalidArgument);
        }
        let low = self.load(address)?;
        let high = self.load(address + WORD_SIZE)?;
        Ok(u64::from(low) | (u64::from(high) << 32))
    }

    /// Stores a pointer-sized little-endian value made of two words.
    ///
    /// # Errors
    ///
    /// See [`AddressSpace::load_u64`].
    pub fn store_u64(&self, address: usize, value: u64) -> Result<(), Error> {
        if address % size_of::<u64>() != 0 {
            return Err(Error::InvalidArgument);
        }
        let [b0, b1, b2, b3, b4, b5, b6, b7] = value.to_le_bytes();
        self.store(address, u32::from_le_bytes([b0, b1, b2, b3]))?;
        self.store(address + WORD_SIZE, u32::from_le_bytes([b4, b5, b6, b7]))
    }

    /// Applies `op` to the word at `address` and returns the previous value.
    pub(crate) fn apply(&self, address: usize, op: &WakeOp) -> Result<u32, Error> {
        self.with_word(address, |word| {
            match word.fetch_update(SeqCst, SeqCst, |old| Some(op.apply(old))) {
                Ok(previous) | Err(previous) => previous,
            }
        })
    }

    /// Finds the object and offset backing `address`.
    pub(crate) fn locate(&self, address: usize) -> Result<Location, Error> {
        let regions = self.regions.read();
        let (start, region) = regions.range(..=address).next_back().ok_or(Error::Fault)?;
        let delta = address - start;
        if delta >= region.len {
            return Err(Error::Fault);
        }
        Ok(Location {
            object: region.object.clone(),
            offset: region.offset + delta,
            shared: region.shared,
        })
    }

    fn map(&self, object: Arc<MemoryObject>, offset: usize, len: usize, shared: bool) -> usize {
        let len = len.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        // One unmapped guard page between consecutive mappings.
        let address = self.next_address.fetch_add(len + PAGE_SIZE, Relaxed);
        self.regions.write().insert(
            address,
            Region {
                len,
                object,
                offset,
                shared,
            },
        );
        address
    }

    fn with_word<R, F: FnOnce(&AtomicU32) -> R>(&self, address: usize, f: F) -> Result<R, Error> {
        if address % WORD_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        let location = self.locate(address)?;
        let word = location.object.word(location.offset).ok_or(Error::Fault)?;
        Ok(f(word))
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("mappings", &self.regions.read().len())
            .finish()
    }
}
