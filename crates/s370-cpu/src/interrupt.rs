//! PSW swap / "suppress" logic (§4.5.4): the one place every interruption
//! class funnels through to save the old PSW and load the new one.

use s370_core::lowmem;
use s370_core::{ExternalSource, MainStore, ProgramException};

use crate::psw::Psw;

fn load_words(store: &mut MainStore, addr: u32) -> [u32; 2] {
    [
        store.get_word(addr).unwrap_or(0),
        store.get_word(addr + 4).unwrap_or(0),
    ]
}

fn store_words(store: &mut MainStore, addr: u32, words: [u32; 2]) {
    let _ = store.put_word(addr, words[0]);
    let _ = store.put_word(addr + 4, words[1]);
}

fn put_byte(store: &mut MainStore, addr: u32, byte: u8) {
    let aligned = addr & !0x3;
    let idx = addr & 0x3;
    let mask = 0x08u8 >> idx;
    let _ = store.put_word_mask(aligned, u32::from(byte) << (8 * (3 - idx)), mask);
}

fn put_low24(store: &mut MainStore, addr: u32, value: u32) {
    let _ = store.put_word_mask(addr, value & 0x00FF_FFFF, 0b0111);
}

/// Swap the old PSW out to `old_vector` and the new one in from
/// `old_vector + NEW_PSW_OFFSET`, reusing the current mode for both
/// encodings (EC/BC consistently, §4.5.4 step 5).
fn swap(psw: &mut Psw, store: &mut MainStore, old_vector: u32) {
    let ec_mode = psw.ec_mode;
    store_words(store, old_vector, psw.encode());
    let new_words = load_words(store, old_vector + lowmem::NEW_PSW_OFFSET);
    let candidate = Psw::decode(new_words, ec_mode);
    if ec_mode && new_words[0] & 0x0000_3000 != 0 {
        // Reserved bits set in the freshly loaded PSW: rather than take a
        // recursive program-check (which could loop if the new-PSW area
        // itself is malformed), stop the CPU in a disabled wait state.
        *psw = Psw {
            wait: true,
            ..candidate
        };
        return;
    }
    *psw = candidate;
}

/// A program interruption (§7, §4.5 step 8): `ilc` is the instruction-
/// length code of the faulting instruction, `per_code`/`per_addr` carry
/// any PER event OR'd into the interruption code per the design notes'
/// resolved open question.
pub fn take_program(
    psw: &mut Psw,
    store: &mut MainStore,
    exception: ProgramException,
    ilc: u8,
    per_code: u8,
    per_addr: u32,
) {
    let mut code = u16::from(exception.code());
    if per_code != 0 {
        code |= 0x0080;
    }
    psw.ilc = ilc;
    psw.interruption_code = code;
    swap(psw, store, lowmem::OPPSW);
    if per_code != 0 {
        put_byte(store, lowmem::PER_CODE, per_code);
        put_low24(store, lowmem::PER_ADDR, per_addr);
    }
    let ilc_word = (u32::from(ilc) << 30) | (u32::from(per_code) << 16) | u32::from(code);
    let _ = store.put_word(lowmem::PGM_ILC_CODE & !0x3, ilc_word);
}

/// Supervisor call (§7): `code` is the SVC instruction's immediate byte.
pub fn take_svc(psw: &mut Psw, store: &mut MainStore, code: u8, ilc: u8) {
    psw.ilc = ilc;
    psw.interruption_code = u16::from(code);
    swap(psw, store, lowmem::OSVC);
}

/// External interruption (§7, §4.5 step 2).
pub fn take_external(psw: &mut Psw, store: &mut MainStore, source: ExternalSource) {
    psw.interruption_code = source.code();
    swap(psw, store, lowmem::OEXT);
}

/// I/O interruption, posted by `Chan_scan` (§4.4.3, §7): the interruption
/// code carries the completing device's number.
pub fn take_io(psw: &mut Psw, store: &mut MainStore, devnum: u16) {
    psw.interruption_code = devnum;
    swap(psw, store, lowmem::OIO);
    if psw.ec_mode {
        let _ = store.put_word(lowmem::IOCODE_EC & !0x3, u32::from(devnum));
    }
}

/// Machine check, software-triggered only via the `MC` instruction (§7).
pub fn take_machine_check(psw: &mut Psw, store: &mut MainStore) {
    swap(psw, store, lowmem::OMCK);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svc_stores_old_pc_and_loads_new_pc() {
        let mut store = MainStore::new(4096);
        store.put_word(lowmem::NSVC, 0x0000_0000).unwrap();
        store.put_word(lowmem::NSVC + 4, 0x0000_0500).unwrap();
        let mut psw = Psw {
            ec_mode: false,
            pc: 0x0000_0402,
            ..Psw::default()
        };
        take_svc(&mut psw, &mut store, 10, 1);
        assert_eq!(psw.pc, 0x0000_0500);
        let old = store.get_word(lowmem::OSVC + 4).unwrap();
        assert_eq!(old & 0x00FF_FFFF, 0x0000_0402);
    }

    #[test]
    fn program_check_stores_exception_code() {
        let mut store = MainStore::new(4096);
        store.put_word(lowmem::NPPSW, 0).unwrap();
        store.put_word(lowmem::NPPSW + 4, 0x0000_0600).unwrap();
        let mut psw = Psw {
            ec_mode: true,
            pc: 0x0000_0200,
            ..Psw::default()
        };
        take_program(&mut psw, &mut store, ProgramException::Addressing, 2, 0, 0);
        assert_eq!(psw.pc, 0x0000_0600);
        assert_eq!(psw.interruption_code, u16::from(ProgramException::Addressing.code()));
    }
}
