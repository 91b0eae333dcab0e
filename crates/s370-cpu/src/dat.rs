//! Dynamic Address Translation and the 256-entry TLB (§3.2, §4.5.3 step 1).
//!
//! Page size is fixed at 2KB, matching the storage-key block size, so the
//! universal invariant in §8.1 (`address(translate(a)) & 0x7FF == a & 0x7FF`)
//! holds by construction: translation only ever remaps bits above the low
//! 11. Segments hold 128 pages (256KB), so a 24-bit virtual address splits
//! evenly into a 6-bit segment number, 7-bit page-in-segment index, and
//! 11-bit byte-in-page offset.

use s370_core::{MainStore, ProgramException};

const PAGE_SHIFT: u32 = 11;
const PAGE_MASK: u32 = (1 << PAGE_SHIFT) - 1;
const PAGES_PER_SEGMENT: u32 = 128;
const SEGMENT_SHIFT: u32 = 7; // log2(PAGES_PER_SEGMENT)

#[derive(Debug, Clone, Copy, Default)]
struct TlbEntry {
    valid: bool,
    tag: u32,
    frame: u32,
}

/// 256-entry, direct-mapped TLB keyed by the low 8 bits of the virtual
/// page number (§3.2).
pub struct Dat {
    entries: [TlbEntry; 256],
}

impl Default for Dat {
    fn default() -> Self {
        Self::new()
    }
}

impl Dat {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: [TlbEntry::default(); 256],
        }
    }

    /// Purge all entries (LCTL of CR1, or PTLB, §3.2).
    pub fn purge(&mut self) {
        self.entries = [TlbEntry::default(); 256];
    }

    /// Translate virtual address `vaddr` to a physical address, walking
    /// the segment/page tables rooted at `seg_table_base` on a TLB miss
    /// and installing the result (§4.5.3 step 1).
    pub fn translate(
        &mut self,
        vaddr: u32,
        seg_table_base: u32,
        store: &mut MainStore,
    ) -> Result<u32, ProgramException> {
        let page_number = (vaddr >> PAGE_SHIFT) & 0x1FFF;
        let idx = (page_number & 0xFF) as usize;
        let offset = vaddr & PAGE_MASK;

        if self.entries[idx].valid && self.entries[idx].tag == page_number {
            return Ok(self.entries[idx].frame | offset);
        }

        let segment = page_number >> SEGMENT_SHIFT;
        let page_in_seg = page_number & (PAGES_PER_SEGMENT - 1);

        let ste_addr = (seg_table_base & 0x00FF_FFFF).wrapping_add(segment * 4);
        let ste = store
            .get_word(ste_addr)
            .map_err(|_| ProgramException::SegmentTranslation)?;
        if ste & 0x0100_0000 != 0 {
            return Err(ProgramException::SegmentTranslation);
        }
        let length = (ste >> 25) & 0x7F;
        if page_in_seg > length {
            return Err(ProgramException::SegmentTranslation);
        }
        let pt_origin = ste & 0x00FF_FFFF;

        let pte_addr = pt_origin.wrapping_add(page_in_seg * 4);
        let pte = store
            .get_word(pte_addr)
            .map_err(|_| ProgramException::PageTranslation)?;
        if pte & 0x0100_0000 != 0 {
            return Err(ProgramException::PageTranslation);
        }
        if pte & 0xFE00_0000 != 0 {
            return Err(ProgramException::TranslationSpecification);
        }
        let frame = pte & 0x00FF_F800; // page-aligned (low 11 bits zero)

        self.entries[idx] = TlbEntry {
            valid: true,
            tag: page_number,
            frame,
        };
        Ok(frame | offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_identity_map(store: &mut MainStore, seg_base: u32, vaddr: u32, frame: u32) {
        let page_number = (vaddr >> PAGE_SHIFT) & 0x1FFF;
        let segment = page_number >> SEGMENT_SHIFT;
        let page_in_seg = page_number & (PAGES_PER_SEGMENT - 1);
        let pt_origin = seg_base + 0x1000;
        store.put_word(seg_base + segment * 4, pt_origin).unwrap();
        store
            .put_word(pt_origin + page_in_seg * 4, frame)
            .unwrap();
    }

    #[test]
    fn translation_preserves_low_page_bits() {
        let mut store = MainStore::new(64 * 1024);
        let mut dat = Dat::new();
        install_identity_map(&mut store, 0x2000, 0x0001_0800, 0x0000_4000);
        let phys = dat.translate(0x0001_0855, 0x2000, &mut store).unwrap();
        assert_eq!(phys & 0x7FF, 0x0001_0855 & 0x7FF);
        assert_eq!(phys, 0x0000_4055);
    }

    #[test]
    fn tlb_hit_matches_fresh_walk() {
        let mut store = MainStore::new(64 * 1024);
        let mut dat = Dat::new();
        install_identity_map(&mut store, 0x2000, 0x0001_0800, 0x0000_4000);
        let first = dat.translate(0x0001_0801, 0x2000, &mut store).unwrap();
        let second = dat.translate(0x0001_0802, 0x2000, &mut store).unwrap();
        assert_eq!(first & !PAGE_MASK, second & !PAGE_MASK);
    }

    #[test]
    fn invalid_page_table_entry_is_page_translation_exception() {
        let mut store = MainStore::new(64 * 1024);
        let mut dat = Dat::new();
        let pt_origin = 0x3000;
        store.put_word(0x2000, pt_origin).unwrap();
        store.put_word(pt_origin, 0x0100_0000).unwrap(); // invalid bit
        let err = dat.translate(0x0000_0000, 0x2000, &mut store).unwrap_err();
        assert_eq!(err, ProgramException::PageTranslation);
    }

    #[test]
    fn purge_forces_a_fresh_walk() {
        let mut store = MainStore::new(64 * 1024);
        let mut dat = Dat::new();
        install_identity_map(&mut store, 0x2000, 0x0001_0800, 0x0000_4000);
        dat.translate(0x0001_0800, 0x2000, &mut store).unwrap();
        dat.purge();
        install_identity_map(&mut store, 0x2000, 0x0001_0800, 0x0000_8000);
        let phys = dat.translate(0x0001_0800, 0x2000, &mut store).unwrap();
        assert_eq!(phys, 0x0000_8000);
    }
}
