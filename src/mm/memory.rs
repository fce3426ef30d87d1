//! Simulated Tagged Memory
//!
//! Backs the machine with a page-granular memory in which every
//! 16-byte granule carries a capability tag. Plain byte stores clear
//! the tags of the granules they touch, so a capability cannot be
//! forged by writing its representation as data.
//!
//! # Design
//! - Mappings are handed out from a bump cursor with a guard page
//!   between neighbours
//! - Each access is checked against the presented capability (tag,
//!   seal, bounds, permissions) and the page protection
//! - The bounds-checked copy helpers treat an invalid or exhausted
//!   capability as having zero remaining bytes instead of faulting
//!
//! # Security Properties
//! - Unmapped pages are zeroed before release
//! - Double release is detected and refused

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::cap::{CapPerms, Capability};
use crate::error::{Fault, Result};
use crate::security::Zeroize;

use super::{align_down, Prot, CAP_SIZE, PAGE_MASK, PAGE_SIZE};

/// One mapped page: contents plus current protection.
struct Page {
    bytes: Vec<u8>,
    prot: Prot,
}

impl Page {
    fn new(prot: Prot) -> Self {
        Self {
            bytes: vec![0; PAGE_SIZE],
            prot,
        }
    }
}

/// The simulated physical memory of one machine.
pub struct Memory {
    /// Mapped pages keyed by page base address.
    pages: BTreeMap<usize, Page>,
    /// Valid capabilities at granule-aligned addresses. Presence of
    /// a key is the tag bit; byte stores remove keys.
    tags: BTreeMap<usize, Capability>,
    /// Bump cursor for fresh mappings.
    next_map: usize,
    /// First address past the arena.
    arena_limit: usize,
}

impl Memory {
    /// Create an empty memory with an arena of `arena_pages` pages
    /// starting at `arena_base`.
    pub(crate) fn new(arena_base: usize, arena_pages: usize) -> Self {
        Self {
            pages: BTreeMap::new(),
            tags: BTreeMap::new(),
            next_map: arena_base,
            arena_limit: arena_base + arena_pages * PAGE_SIZE,
        }
    }

    /// Map `count` fresh zeroed pages and return their base address.
    ///
    /// A guard page is left unmapped after every mapping, so runaway
    /// access past a mapping can never land in its neighbour.
    pub(crate) fn map_pages(&mut self, count: usize, prot: Prot) -> Result<usize> {
        if count == 0 {
            return Err(Fault::ResourceExhausted);
        }
        let len = count * PAGE_SIZE;
        let base = self.next_map;
        let end = base.checked_add(len).ok_or(Fault::ResourceExhausted)?;
        if end > self.arena_limit {
            return Err(Fault::ResourceExhausted);
        }
        for i in 0..count {
            self.pages.insert(base + i * PAGE_SIZE, Page::new(prot));
        }
        self.next_map = end + PAGE_SIZE;
        Ok(base)
    }

    /// Change the protection of every page in `[base, base + len)`.
    ///
    /// `base` must be page-aligned and the whole range mapped.
    pub(crate) fn protect(&mut self, base: usize, len: usize, prot: Prot) -> Result<()> {
        if base & PAGE_MASK != 0 {
            return Err(Fault::InvalidCapability);
        }
        let count = (len + PAGE_MASK) >> super::PAGE_SHIFT;
        for i in 0..count {
            if !self.pages.contains_key(&(base + i * PAGE_SIZE)) {
                return Err(Fault::InvalidCapability);
            }
        }
        for i in 0..count {
            if let Some(page) = self.pages.get_mut(&(base + i * PAGE_SIZE)) {
                page.prot = prot;
            }
        }
        Ok(())
    }

    /// Release the mapping owned by `owning`.
    ///
    /// The capability must be valid, carry the vmem permission and
    /// span the mapping exactly. Page contents are zeroed before the
    /// pages are forgotten; releasing an unmapped range is refused.
    pub(crate) fn unmap(&mut self, owning: &Capability) -> Result<()> {
        if !owning.is_valid() {
            return Err(Fault::InvalidCapability);
        }
        if !owning.check_perms(CapPerms::VMEM) {
            return Err(Fault::PermissionDenied);
        }
        let base = owning.base();
        if base & PAGE_MASK != 0 {
            return Err(Fault::InvalidCapability);
        }
        let count = (owning.length() + PAGE_MASK) >> super::PAGE_SHIFT;
        for i in 0..count {
            if !self.pages.contains_key(&(base + i * PAGE_SIZE)) {
                return Err(Fault::InvalidCapability);
            }
        }
        for i in 0..count {
            let page_base = base + i * PAGE_SIZE;
            if let Some(mut page) = self.pages.remove(&page_base) {
                page.bytes.as_mut_slice().zeroize();
            }
        }
        let in_range: Vec<usize> = self
            .tags
            .range(base..base + count * PAGE_SIZE)
            .map(|(&a, _)| a)
            .collect();
        for addr in in_range {
            self.tags.remove(&addr);
        }
        Ok(())
    }

    /// Load `len` bytes through a capability.
    pub fn load_bytes(&self, cap: &Capability, len: usize) -> Result<Vec<u8>> {
        self.check_access(cap, len, CapPerms::LOAD, Prot::READ)?;
        let mut out = vec![0; len];
        self.read_raw(cap.address(), &mut out)?;
        Ok(out)
    }

    /// Load a little-endian u32 through a capability.
    pub fn load_u32(&self, cap: &Capability) -> Result<u32> {
        let bytes = self.load_bytes(cap, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Store bytes through a capability.
    ///
    /// Clears the capability tag of every granule the store touches.
    pub fn store_bytes(&mut self, cap: &Capability, data: &[u8]) -> Result<()> {
        self.check_access(cap, data.len(), CapPerms::STORE, Prot::WRITE)?;
        self.clear_tags(cap.address(), data.len());
        self.write_raw(cap.address(), data)
    }

    /// Store a little-endian u32 through a capability.
    pub fn store_u32(&mut self, cap: &Capability, value: u32) -> Result<()> {
        self.store_bytes(cap, &value.to_le_bytes())
    }

    /// Load a capability-width value through a capability.
    ///
    /// The address must be granule-aligned. Without the load-cap
    /// permission the loaded value arrives with its tag cleared; a
    /// granule never written with `store_cap` (or overwritten by a
    /// byte store since) is untagged.
    pub fn load_cap(&self, cap: &Capability) -> Result<Capability> {
        self.check_access(cap, CAP_SIZE, CapPerms::LOAD, Prot::READ)?;
        let addr = cap.address();
        if addr % CAP_SIZE != 0 {
            return Err(Fault::InvalidCapability);
        }
        match self.tags.get(&addr) {
            Some(value) if cap.check_perms(CapPerms::LOAD_CAP) => Ok(*value),
            Some(value) => Ok(Capability::untagged(value.address())),
            None => {
                let mut bytes = [0u8; 8];
                self.read_raw(addr, &mut bytes)?;
                Ok(Capability::untagged(u64::from_le_bytes(bytes) as usize))
            }
        }
    }

    /// Store a capability-width value through a capability.
    ///
    /// Requires store and store-cap permissions; storing a local
    /// value additionally requires store-local-cap.
    pub fn store_cap(&mut self, at: &Capability, value: Capability) -> Result<()> {
        self.check_access(at, CAP_SIZE, CapPerms::STORE | CapPerms::STORE_CAP, Prot::WRITE)?;
        let addr = at.address();
        if addr % CAP_SIZE != 0 {
            return Err(Fault::InvalidCapability);
        }
        // Locality is judged on the stored value's real permission
        // field: sealing hides permissions from queries, not from the
        // store-local check. Untagged values are plain data.
        if value.tag
            && !value.perms.contains(CapPerms::GLOBAL)
            && !at.check_perms(CapPerms::STORE_LOCAL_CAP)
        {
            return Err(Fault::PermissionDenied);
        }
        let mut bytes = [0u8; CAP_SIZE];
        bytes[..8].copy_from_slice(&(value.address() as u64).to_le_bytes());
        bytes[8..].copy_from_slice(&(value.length as u64).to_le_bytes());
        self.write_raw(addr, &bytes)?;
        if value.tag() {
            self.tags.insert(addr, value);
        } else {
            self.tags.remove(&addr);
        }
        Ok(())
    }

    /// Bounds-checked write: store as many bytes as the destination
    /// has remaining, never more.
    ///
    /// An invalid or out-of-bounds destination has zero remaining
    /// bytes, so the call degrades to writing nothing. Returns the
    /// number of bytes written.
    pub fn write_bounded(&mut self, dst: &Capability, data: &[u8]) -> Result<usize> {
        let n = data.len().min(dst.tail());
        if n == 0 {
            return Ok(0);
        }
        self.store_bytes(&dst.set_bounds_exact(n), &data[..n])?;
        Ok(n)
    }

    /// Bounds-checked copy between capabilities: moves
    /// `min(len, tail(src), tail(dst))` bytes. Returns the number of
    /// bytes copied.
    pub fn copy_bounded(
        &mut self,
        dst: &Capability,
        src: &Capability,
        len: usize,
    ) -> Result<usize> {
        let n = len.min(src.tail()).min(dst.tail());
        if n == 0 {
            return Ok(0);
        }
        let bytes = self.load_bytes(&src.set_bounds_exact(n), n)?;
        self.store_bytes(&dst.set_bounds_exact(n), &bytes)?;
        Ok(n)
    }

    /// Bounds-checked fill: set up to `min(len, tail(dst))` bytes.
    /// Returns the number of bytes set.
    pub fn fill_bounded(&mut self, dst: &Capability, byte: u8, len: usize) -> Result<usize> {
        let n = len.min(dst.tail());
        if n == 0 {
            return Ok(0);
        }
        self.store_bytes(&dst.set_bounds_exact(n), &vec![byte; n])?;
        Ok(n)
    }

    /// Validate one access: capability tag/seal/bounds, capability
    /// permissions, then page protection over the whole range.
    fn check_access(
        &self,
        cap: &Capability,
        len: usize,
        required: CapPerms,
        prot: Prot,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if !cap.is_valid() || cap.tail() < len {
            return Err(Fault::InvalidCapability);
        }
        if !cap.check_perms(required) {
            return Err(Fault::PermissionDenied);
        }
        let start = align_down(cap.address(), PAGE_SIZE);
        let end = cap.address() + len;
        let mut page_base = start;
        while page_base < end {
            match self.pages.get(&page_base) {
                None => return Err(Fault::InvalidCapability),
                Some(page) if !page.prot.contains(prot) => {
                    return Err(Fault::PermissionDenied);
                }
                Some(_) => {}
            }
            page_base += PAGE_SIZE;
        }
        Ok(())
    }

    /// Remove the tag of every granule in `[addr, addr + len)`.
    fn clear_tags(&mut self, addr: usize, len: usize) {
        if len == 0 {
            return;
        }
        let first = align_down(addr, CAP_SIZE);
        let last = align_down(addr + len - 1, CAP_SIZE);
        let mut g = first;
        while g <= last {
            self.tags.remove(&g);
            g += CAP_SIZE;
        }
    }

    fn read_raw(&self, addr: usize, out: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            let a = addr + done;
            let page_base = align_down(a, PAGE_SIZE);
            let page = self.pages.get(&page_base).ok_or(Fault::InvalidCapability)?;
            let off = a - page_base;
            let n = (PAGE_SIZE - off).min(out.len() - done);
            out[done..done + n].copy_from_slice(&page.bytes[off..off + n]);
            done += n;
        }
        Ok(())
    }

    fn write_raw(&mut self, addr: usize, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let a = addr + done;
            let page_base = align_down(a, PAGE_SIZE);
            let page = self
                .pages
                .get_mut(&page_base)
                .ok_or(Fault::InvalidCapability)?;
            let off = a - page_base;
            let n = (PAGE_SIZE - off).min(data.len() - done);
            page.bytes[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Addresses of tagged granules in `[start, end)`, low to high.
    ///
    /// Used by the stack-scanning demonstration; the scan itself must
    /// still load each granule through a capability it holds.
    pub fn tagged_granules(&self, start: usize, end: usize) -> Vec<usize> {
        self.tags.range(start..end).map(|(&a, _)| a).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Memory, Capability) {
        let mut mem = Memory::new(super::super::DATA_BASE, 64);
        let base = mem.map_pages(2, Prot::RW).unwrap();
        let cap = Capability::root(
            base,
            2 * PAGE_SIZE,
            CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS | CapPerms::WRITE_CAP_PERMS,
        );
        (mem, cap)
    }

    #[test]
    fn test_round_trip_bytes() {
        let (mut mem, cap) = setup();
        mem.store_bytes(&cap, b"hello").unwrap();
        assert_eq!(mem.load_bytes(&cap, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_out_of_bounds_store_refused() {
        let (mut mem, cap) = setup();
        let end = cap.with_address(cap.limit() - 4);
        assert_eq!(
            mem.store_bytes(&end, &[0u8; 8]),
            Err(Fault::InvalidCapability)
        );
    }

    #[test]
    fn test_missing_permission_refused() {
        let (mut mem, cap) = setup();
        let ro = cap.perms_and(CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS);
        assert_eq!(
            mem.store_bytes(&ro, &[1, 2, 3]),
            Err(Fault::PermissionDenied)
        );
    }

    #[test]
    fn test_page_protection_checked() {
        let (mut mem, cap) = setup();
        mem.protect(cap.base(), PAGE_SIZE, Prot::READ).unwrap();
        // The capability still has store permission, but the page
        // no longer admits writes.
        assert_eq!(
            mem.store_bytes(&cap, &[1]),
            Err(Fault::PermissionDenied)
        );
        let second = cap.with_address(cap.base() + PAGE_SIZE);
        mem.store_bytes(&second, &[1]).unwrap();
    }

    #[test]
    fn test_cap_round_trip_and_tag_clearing() {
        let (mut mem, cap) = setup();
        let value = cap.with_address(cap.base() + 0x40).set_bounds_exact(8);
        let slot = cap.with_address(cap.base() + 0x100);
        mem.store_cap(&slot, value).unwrap();
        let loaded = mem.load_cap(&slot).unwrap();
        assert!(loaded.tag());
        assert_eq!(loaded, value);

        // A byte store into the granule strips the tag.
        mem.store_bytes(&slot.set_bounds_exact(1), &[0xff]).unwrap();
        let stripped = mem.load_cap(&slot).unwrap();
        assert!(!stripped.tag());
    }

    #[test]
    fn test_load_cap_without_loadcap_perm_strips_tag() {
        let (mut mem, cap) = setup();
        let slot = cap.with_address(cap.base() + 0x20);
        mem.store_cap(&slot, cap).unwrap();
        let data_only = slot.perms_and(
            CapPerms::GLOBAL | CapPerms::LOAD | CapPerms::WRITE_CAP_PERMS,
        );
        let loaded = mem.load_cap(&data_only).unwrap();
        assert!(!loaded.tag());
        assert_eq!(loaded.address(), cap.address());
    }

    #[test]
    fn test_bounded_write_degrades() {
        let (mut mem, cap) = setup();
        let small = cap.set_bounds_exact(8);
        let n = mem.write_bounded(&small, &[0xaa; 12]).unwrap();
        assert_eq!(n, 8);
        // Past-the-end byte untouched.
        let after = cap.with_address(cap.base() + 8);
        assert_eq!(mem.load_bytes(&after, 1).unwrap(), vec![0]);
        // An invalid destination has zero remaining bytes.
        let dead = small.with_address(cap.limit());
        assert_eq!(mem.write_bounded(&dead, &[1]).unwrap(), 0);
    }

    #[test]
    fn test_bounded_copy_stops_at_the_shorter_side() {
        let (mut mem, cap) = setup();
        let src = cap.set_bounds_exact(16);
        mem.store_bytes(&src, &[0x11; 16]).unwrap();
        let dst = cap.with_address(cap.base() + 0x80).set_bounds_exact(8);
        let n = mem.copy_bounded(&dst, &src, 16).unwrap();
        assert_eq!(n, 8);
        assert_eq!(mem.load_bytes(&dst, 8).unwrap(), vec![0x11; 8]);
    }

    #[test]
    fn test_storing_local_cap_needs_store_local_perm() {
        let (mut mem, cap) = setup();
        let local = cap.set_bounds_exact(8).perms_and(
            CapPerms::READ_CAP_PERMS | CapPerms::WRITE_CAP_PERMS,
        );
        assert!(local.is_local());
        let slot = cap.with_address(cap.base() + 0x40);
        let no_local_store = slot.perms_and(
            CapPerms::GLOBAL
                | CapPerms::READ_CAP_PERMS
                | CapPerms::LOAD
                | CapPerms::STORE
                | CapPerms::STORE_CAP,
        );
        assert_eq!(
            mem.store_cap(&no_local_store, local),
            Err(Fault::PermissionDenied)
        );
        // The full write-capability group includes store-local.
        mem.store_cap(&slot, local).unwrap();
    }

    #[test]
    fn test_arena_exhaustion() {
        let mut mem = Memory::new(super::super::DATA_BASE, 4);
        assert!(mem.map_pages(2, Prot::RW).is_ok());
        assert_eq!(mem.map_pages(8, Prot::RW), Err(Fault::ResourceExhausted));
    }

    #[test]
    fn test_unmap_scrubs_and_detects_double_free() {
        let mut mem = Memory::new(super::super::DATA_BASE, 8);
        let base = mem.map_pages(1, Prot::RW).unwrap();
        let owning = Capability::root(
            base,
            PAGE_SIZE,
            CapPerms::GLOBAL
                | CapPerms::READ_CAP_PERMS
                | CapPerms::WRITE_CAP_PERMS
                | CapPerms::VMEM,
        );
        mem.store_bytes(&owning, b"secret").unwrap();
        mem.unmap(&owning).unwrap();
        assert_eq!(mem.unmap(&owning), Err(Fault::InvalidCapability));

        let no_vmem = Capability::root(base, PAGE_SIZE, CapPerms::WRITE_CAP_PERMS);
        assert_eq!(mem.unmap(&no_vmem), Err(Fault::PermissionDenied));
    }

    #[test]
    fn test_guard_page_between_mappings() {
        let mut mem = Memory::new(super::super::DATA_BASE, 16);
        let a = mem.map_pages(1, Prot::RW).unwrap();
        let b = mem.map_pages(1, Prot::RW).unwrap();
        assert!(b >= a + 2 * PAGE_SIZE);
    }
}
