//! Opcode decoding.
//!
//! Each opcode byte maps to an instruction class; operand selection is
//! recovered from the opcode's bit fields at execution time. Three tables
//! cover the main, CB and ED opcode spaces; DD/FD only swap the register
//! decode, they never change the class.

/// Bits 5-3 of an opcode.
#[inline]
pub(crate) fn y(opcode: u8) -> u8 {
    (opcode >> 3) & 0x07
}

/// Bits 2-0 of an opcode.
#[inline]
pub(crate) fn z(opcode: u8) -> u8 {
    opcode & 0x07
}

/// Bits 5-4 of an opcode.
#[inline]
pub(crate) fn p(opcode: u8) -> u8 {
    (opcode >> 4) & 0x03
}

/// Bits 4-3 of an opcode.
#[inline]
pub(crate) fn q(opcode: u8) -> u8 {
    (opcode >> 3) & 0x03
}

/// Instruction classes. Paired variants (e.g. `LdiLdd`) are distinguished
/// by the opcode byte at execution time, exactly as the operand fields are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    // 8-bit load group
    LdRR,
    LdRN,
    LdRIndHl,
    LdIndHlR,
    LdIndHlN,
    LdAIndBc,
    LdAIndDe,
    LdAIndNn,
    LdIndBcA,
    LdIndDeA,
    LdIndNnA,
    LdAIR,
    LdIRA,

    // 16-bit load group
    LdRrNn,
    LdHlIndNn,
    LdRrIndNn,
    LdIndNnHl,
    LdIndNnRr,
    LdSpHl,
    PushSs,
    PopSs,

    // Exchange, block transfer and search group
    ExDeHl,
    ExAfAf,
    Exx,
    ExIndSpHl,
    LdiLdd,
    LdirLddr,
    CpiCpd,
    CpirCpdr,

    // 8-bit arithmetic and logical group
    AddR,
    AddN,
    AddIndHl,
    AdcR,
    AdcN,
    AdcIndHl,
    SubR,
    SubN,
    SubIndHl,
    SbcR,
    SbcN,
    SbcIndHl,
    AndR,
    AndN,
    AndIndHl,
    OrR,
    OrN,
    OrIndHl,
    XorR,
    XorN,
    XorIndHl,
    CpR,
    CpN,
    CpIndHl,
    IncR,
    IncIndHl,
    DecR,
    DecIndHl,

    // General-purpose arithmetic and CPU control group
    Daa,
    Cpl,
    Neg,
    Ccf,
    Scf,
    Nop,
    Halt,
    Di,
    Ei,
    ImN,

    // 16-bit arithmetic group
    AddHlRr,
    AdcHlRr,
    SbcHlRr,
    IncRr,
    DecRr,

    // Rotate and shift group
    Rlca,
    Rla,
    Rrca,
    Rra,
    RlcR,
    RlcIndHl,
    RlR,
    RlIndHl,
    RrcR,
    RrcIndHl,
    RrR,
    RrIndHl,
    SlaR,
    SlaIndHl,
    SllR,
    SllIndHl,
    SraR,
    SraIndHl,
    SrlR,
    SrlIndHl,
    RldRrd,

    // Bit set, reset and test group
    BitBR,
    BitBIndHl,
    SetBR,
    SetBIndHl,
    ResBR,
    ResBIndHl,

    // Jump group
    JpNn,
    JpCcNn,
    JrE,
    JrDdE,
    JpHl,
    DjnzE,

    // Call and return group
    CallNn,
    CallCcNn,
    Ret,
    RetCc,
    RetiRetn,
    RstP,

    // Input and output group
    InAN,
    InRC,
    IniInd,
    InirIndr,
    OutNA,
    OutCR,
    OutiOutd,
    OtirOtdr,

    // Prefix group
    CbPrefix,
    DdPrefix,
    EdPrefix,
    FdPrefix,

    EdUndefined,
}

/// Decode in the unprefixed opcode space.
pub(crate) fn main_op(opcode: u8) -> Op {
    use Op::*;

    let x = opcode >> 6;
    let y = y(opcode);
    let z = z(opcode);

    match x {
        0 => match z {
            0 => match y {
                0 => Nop,
                1 => ExAfAf,
                2 => DjnzE,
                3 => JrE,
                _ => JrDdE,
            },
            1 => {
                if y & 1 == 0 {
                    LdRrNn
                } else {
                    AddHlRr
                }
            }
            2 => match y {
                0 => LdIndBcA,
                1 => LdAIndBc,
                2 => LdIndDeA,
                3 => LdAIndDe,
                4 => LdIndNnHl,
                5 => LdHlIndNn,
                6 => LdIndNnA,
                _ => LdAIndNn,
            },
            3 => {
                if y & 1 == 0 {
                    IncRr
                } else {
                    DecRr
                }
            }
            4 => {
                if y == 6 {
                    IncIndHl
                } else {
                    IncR
                }
            }
            5 => {
                if y == 6 {
                    DecIndHl
                } else {
                    DecR
                }
            }
            6 => {
                if y == 6 {
                    LdIndHlN
                } else {
                    LdRN
                }
            }
            _ => match y {
                0 => Rlca,
                1 => Rrca,
                2 => Rla,
                3 => Rra,
                4 => Daa,
                5 => Cpl,
                6 => Scf,
                _ => Ccf,
            },
        },
        1 => {
            if opcode == 0x76 {
                Halt
            } else if z == 6 {
                LdRIndHl
            } else if y == 6 {
                LdIndHlR
            } else {
                LdRR
            }
        }
        2 => match y {
            0 => {
                if z == 6 {
                    AddIndHl
                } else {
                    AddR
                }
            }
            1 => {
                if z == 6 {
                    AdcIndHl
                } else {
                    AdcR
                }
            }
            2 => {
                if z == 6 {
                    SubIndHl
                } else {
                    SubR
                }
            }
            3 => {
                if z == 6 {
                    SbcIndHl
                } else {
                    SbcR
                }
            }
            4 => {
                if z == 6 {
                    AndIndHl
                } else {
                    AndR
                }
            }
            5 => {
                if z == 6 {
                    XorIndHl
                } else {
                    XorR
                }
            }
            6 => {
                if z == 6 {
                    OrIndHl
                } else {
                    OrR
                }
            }
            _ => {
                if z == 6 {
                    CpIndHl
                } else {
                    CpR
                }
            }
        },
        _ => match z {
            0 => RetCc,
            1 => match y {
                1 => Ret,
                3 => Exx,
                5 => JpHl,
                7 => LdSpHl,
                _ => PopSs,
            },
            2 => JpCcNn,
            3 => match y {
                0 => JpNn,
                1 => CbPrefix,
                2 => OutNA,
                3 => InAN,
                4 => ExIndSpHl,
                5 => ExDeHl,
                6 => Di,
                _ => Ei,
            },
            4 => CallCcNn,
            5 => match y {
                1 => CallNn,
                3 => DdPrefix,
                5 => EdPrefix,
                7 => FdPrefix,
                _ => PushSs,
            },
            6 => match y {
                0 => AddN,
                1 => AdcN,
                2 => SubN,
                3 => SbcN,
                4 => AndN,
                5 => XorN,
                6 => OrN,
                _ => CpN,
            },
            _ => RstP,
        },
    }
}

/// Decode in the CB opcode space.
pub(crate) fn cb_op(opcode: u8) -> Op {
    use Op::*;

    let x = opcode >> 6;
    let y = y(opcode);
    let indirect = z(opcode) == 6;

    match x {
        0 => match y {
            0 => {
                if indirect {
                    RlcIndHl
                } else {
                    RlcR
                }
            }
            1 => {
                if indirect {
                    RrcIndHl
                } else {
                    RrcR
                }
            }
            2 => {
                if indirect {
                    RlIndHl
                } else {
                    RlR
                }
            }
            3 => {
                if indirect {
                    RrIndHl
                } else {
                    RrR
                }
            }
            4 => {
                if indirect {
                    SlaIndHl
                } else {
                    SlaR
                }
            }
            5 => {
                if indirect {
                    SraIndHl
                } else {
                    SraR
                }
            }
            6 => {
                if indirect {
                    SllIndHl
                } else {
                    SllR
                }
            }
            _ => {
                if indirect {
                    SrlIndHl
                } else {
                    SrlR
                }
            }
        },
        1 => {
            if indirect {
                BitBIndHl
            } else {
                BitBR
            }
        }
        2 => {
            if indirect {
                ResBIndHl
            } else {
                ResBR
            }
        }
        _ => {
            if indirect {
                SetBIndHl
            } else {
                SetBR
            }
        }
    }
}

/// Decode in the ED opcode space. Unassigned slots execute as NOPs.
pub(crate) fn ed_op(opcode: u8) -> Op {
    use Op::*;

    let x = opcode >> 6;
    let y = y(opcode);
    let z = z(opcode);

    match x {
        1 => match z {
            0 => InRC,
            1 => OutCR,
            2 => {
                if y & 1 == 0 {
                    SbcHlRr
                } else {
                    AdcHlRr
                }
            }
            3 => {
                if y & 1 == 0 {
                    LdIndNnRr
                } else {
                    LdRrIndNn
                }
            }
            4 => Neg,
            5 => RetiRetn,
            6 => ImN,
            _ => match y {
                0 | 1 => LdIRA,
                2 | 3 => LdAIR,
                4 | 5 => RldRrd,
                _ => EdUndefined,
            },
        },
        2 if z <= 3 && y >= 4 => match z {
            0 => {
                if y >= 6 {
                    LdirLddr
                } else {
                    LdiLdd
                }
            }
            1 => {
                if y >= 6 {
                    CpirCpdr
                } else {
                    CpiCpd
                }
            }
            2 => {
                if y >= 6 {
                    InirIndr
                } else {
                    IniInd
                }
            }
            _ => {
                if y >= 6 {
                    OtirOtdr
                } else {
                    OutiOutd
                }
            }
        },
        _ => EdUndefined,
    }
}

/// Does this opcode change meaning under a DD/FD prefix? Used to decide
/// whether a prefix run ahead of an opcode is spurious when disassembling.
pub(crate) fn admits_index_prefix(opcode: u8) -> bool {
    matches!(
        opcode,
        0x09 | 0x19
            | 0x21..=0x26
            | 0x29..=0x2E
            | 0x34..=0x36
            | 0x39
            | 0x44..=0x46
            | 0x4C..=0x4E
            | 0x54..=0x56
            | 0x5C..=0x5E
            | 0x60..=0x6F
            | 0x70..=0x75
            | 0x77
            | 0x7C..=0x7E
            | 0x84..=0x86
            | 0x8C..=0x8E
            | 0x94..=0x96
            | 0x9C..=0x9E
            | 0xA4..=0xA6
            | 0xAC..=0xAE
            | 0xB4..=0xB6
            | 0xBC..=0xBE
            | 0xCB
            | 0xE1
            | 0xE3
            | 0xE5
            | 0xE9
            | 0xF9
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_table_spot_checks() {
        assert_eq!(main_op(0x00), Op::Nop);
        assert_eq!(main_op(0x76), Op::Halt);
        assert_eq!(main_op(0x41), Op::LdRR); // LD B,C
        assert_eq!(main_op(0x46), Op::LdRIndHl); // LD B,(HL)
        assert_eq!(main_op(0x70), Op::LdIndHlR); // LD (HL),B
        assert_eq!(main_op(0x3E), Op::LdRN); // LD A,n
        assert_eq!(main_op(0x36), Op::LdIndHlN); // LD (HL),n
        assert_eq!(main_op(0x3C), Op::IncR); // INC A
        assert_eq!(main_op(0x34), Op::IncIndHl);
        assert_eq!(main_op(0x80), Op::AddR);
        assert_eq!(main_op(0x86), Op::AddIndHl);
        assert_eq!(main_op(0xC6), Op::AddN);
        assert_eq!(main_op(0xBF), Op::CpR);
        assert_eq!(main_op(0xC3), Op::JpNn);
        assert_eq!(main_op(0xC9), Op::Ret);
        assert_eq!(main_op(0xCD), Op::CallNn);
        assert_eq!(main_op(0xC7), Op::RstP);
        assert_eq!(main_op(0x10), Op::DjnzE);
        assert_eq!(main_op(0x18), Op::JrE);
        assert_eq!(main_op(0x20), Op::JrDdE);
        assert_eq!(main_op(0xF3), Op::Di);
        assert_eq!(main_op(0xFB), Op::Ei);
        assert_eq!(main_op(0xE3), Op::ExIndSpHl);
        assert_eq!(main_op(0xEB), Op::ExDeHl);
        assert_eq!(main_op(0x08), Op::ExAfAf);
        assert_eq!(main_op(0xD9), Op::Exx);
        assert_eq!(main_op(0xE9), Op::JpHl);
        assert_eq!(main_op(0xF9), Op::LdSpHl);
        assert_eq!(main_op(0xC5), Op::PushSs);
        assert_eq!(main_op(0xF1), Op::PopSs);
        assert_eq!(main_op(0xCB), Op::CbPrefix);
        assert_eq!(main_op(0xDD), Op::DdPrefix);
        assert_eq!(main_op(0xED), Op::EdPrefix);
        assert_eq!(main_op(0xFD), Op::FdPrefix);
        assert_eq!(main_op(0xDB), Op::InAN);
        assert_eq!(main_op(0xD3), Op::OutNA);
    }

    #[test]
    fn test_cb_table_spot_checks() {
        assert_eq!(cb_op(0x00), Op::RlcR);
        assert_eq!(cb_op(0x06), Op::RlcIndHl);
        assert_eq!(cb_op(0x1F), Op::RrR); // RR A
        assert_eq!(cb_op(0x27), Op::SlaR);
        assert_eq!(cb_op(0x36), Op::SllIndHl);
        assert_eq!(cb_op(0x3F), Op::SrlR);
        assert_eq!(cb_op(0x47), Op::BitBR); // BIT 0,A
        assert_eq!(cb_op(0x46), Op::BitBIndHl);
        assert_eq!(cb_op(0x87), Op::ResBR);
        assert_eq!(cb_op(0xC7), Op::SetBR);
        assert_eq!(cb_op(0xFE), Op::SetBIndHl);
    }

    #[test]
    fn test_ed_table_spot_checks() {
        assert_eq!(ed_op(0x44), Op::Neg);
        assert_eq!(ed_op(0x45), Op::RetiRetn); // RETN
        assert_eq!(ed_op(0x4D), Op::RetiRetn); // RETI
        assert_eq!(ed_op(0x46), Op::ImN);
        assert_eq!(ed_op(0x47), Op::LdIRA); // LD I,A
        assert_eq!(ed_op(0x4F), Op::LdIRA); // LD R,A
        assert_eq!(ed_op(0x57), Op::LdAIR); // LD A,I
        assert_eq!(ed_op(0x5F), Op::LdAIR); // LD A,R
        assert_eq!(ed_op(0x67), Op::RldRrd); // RRD
        assert_eq!(ed_op(0x6F), Op::RldRrd); // RLD
        assert_eq!(ed_op(0x40), Op::InRC);
        assert_eq!(ed_op(0x41), Op::OutCR);
        assert_eq!(ed_op(0x42), Op::SbcHlRr);
        assert_eq!(ed_op(0x4A), Op::AdcHlRr);
        assert_eq!(ed_op(0x43), Op::LdIndNnRr);
        assert_eq!(ed_op(0x4B), Op::LdRrIndNn);
        assert_eq!(ed_op(0xA0), Op::LdiLdd);
        assert_eq!(ed_op(0xA8), Op::LdiLdd);
        assert_eq!(ed_op(0xB0), Op::LdirLddr);
        assert_eq!(ed_op(0xB8), Op::LdirLddr);
        assert_eq!(ed_op(0xA1), Op::CpiCpd);
        assert_eq!(ed_op(0xB1), Op::CpirCpdr);
        assert_eq!(ed_op(0xA2), Op::IniInd);
        assert_eq!(ed_op(0xB2), Op::InirIndr);
        assert_eq!(ed_op(0xA3), Op::OutiOutd);
        assert_eq!(ed_op(0xB3), Op::OtirOtdr);
        assert_eq!(ed_op(0x00), Op::EdUndefined);
        assert_eq!(ed_op(0xFF), Op::EdUndefined);
    }

    #[test]
    fn test_bit_field_helpers() {
        assert_eq!(y(0x3C), 7);
        assert_eq!(z(0x3C), 4);
        assert_eq!(p(0x31), 3);
        assert_eq!(q(0x31), 2);
    }

    #[test]
    fn test_index_prefix_admission() {
        assert!(admits_index_prefix(0x21)); // LD IX,nn
        assert!(admits_index_prefix(0x36)); // LD (IX+d),n
        assert!(admits_index_prefix(0x7E)); // LD A,(IX+d)
        assert!(admits_index_prefix(0xE9)); // JP (IX)
        assert!(admits_index_prefix(0xCB));
        assert!(!admits_index_prefix(0x00)); // NOP
        assert!(!admits_index_prefix(0x3E)); // LD A,n
        assert!(!admits_index_prefix(0xC3)); // JP nn
        assert!(!admits_index_prefix(0x76)); // HALT
    }
}
