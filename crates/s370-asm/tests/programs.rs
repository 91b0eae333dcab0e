//! Whole-program assemble/disassemble round trips (§8.2): assembling a
//! short multi-format program and disassembling its bytes back must
//! reproduce the same mnemonic lines, in order.

use s370_asm::{assemble, disassemble};

#[test]
fn a_small_program_round_trips_through_every_format() {
    let source = "\
* load two operands, add, and store the result
L 1,0(15)
L 2,4(15)
AR 1,2
ST 1,8(15)
BCR 15,14
";
    let bytes = assemble(source).unwrap();
    let text = disassemble(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        vec!["L 1,0(15)", "L 2,4(15)", "AR 1,2", "ST 1,8(15)", "BCR 15,14",]
    );
}

#[test]
fn comment_and_blank_lines_do_not_appear_in_assembled_bytes() {
    let source = "\
* this is a comment
LR 1,2

AR 1,2
";
    let bytes = assemble(source).unwrap();
    assert_eq!(bytes, vec![0x18, 0x12, 0x1A, 0x12]);
}

#[test]
fn decimal_and_logical_storage_program_round_trips() {
    let source = "\
MVC 0(8,1),16(2)
ZAP 0(4,1),8(3,2)
CLI 10(5),0x40
";
    let bytes = assemble(source).unwrap();
    let text = disassemble(&bytes);
    assert_eq!(
        text.lines().collect::<Vec<_>>(),
        vec!["MVC 0(8,1),16(2)", "ZAP 0(4,1),8(3,2)", "CLI 10(5),64",]
    );
}

#[test]
fn unknown_mnemonic_in_a_program_fails_the_whole_assembly() {
    let source = "LR 1,2\nFROB 3,4\nAR 1,2\n";
    assert!(assemble(source).is_err());
}

#[test]
fn disassembling_an_unrecognized_opcode_falls_back_to_a_data_constant() {
    // Byte 0xFF is unassigned in the opcode table.
    let text = disassemble(&[0xFF]);
    assert_eq!(text.trim(), "DC X'FF'");
}
