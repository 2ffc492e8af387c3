//! The argument-location allocator.
//!
//! A pure function from a sequence of argument byte sizes (plus a variadic
//! cutoff) to a map recording where each argument's bytes live: in register
//! halves, in whole register pairs, or in the stack argument area.
//!
//! The allocator walks the arguments in order and consumes them byte by
//! byte. A single-byte argument claims one 8-bit register from the ordered
//! pool A, B, C, D, E, H, L, splitting a pair in half; a wider argument
//! claims whole 16-bit pairs from the ordered pool HL, DE, BC while both
//! halves are still free, and the residue spills to the stack. Arguments at
//! or past the variadic cutoff go entirely to the stack, so the callee can
//! walk them uniformly. IX and IY are the frame registers and take no part.
//!
//! Availability is tracked as a bit mask of register halves; both halves of
//! a pair must be free for the pair to be claimed whole, and a pair split
//! by an earlier 8-bit claim stays unavailable as a pair.

use super::ic::{Reg, Reg16};

/// Which part of a 16-bit register a slot occupies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotPart {
    /// The whole pair (two bytes).
    Whole,
    /// The high half (one byte).
    High,
    /// The low half (one byte).
    Low,
}

/// One register slot of an argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegSlot {
    /// The 16-bit register the slot belongs to.
    pub reg: Reg16,
    /// Which part of it the slot uses.
    pub part: SlotPart,
}

impl RegSlot {
    /// Bytes covered by the slot.
    pub fn bytes(self) -> u16 {
        match self.part {
            SlotPart::Whole => 2,
            SlotPart::High | SlotPart::Low => 1,
        }
    }

    /// The 8-bit register of a half slot. The accumulator is the high half
    /// of AF.
    pub fn half_reg(self) -> Option<Reg> {
        if self.reg == Reg16::AF {
            return match self.part {
                SlotPart::High => Some(Reg::A),
                _ => None,
            };
        }
        let (hi, lo) = self.reg.halves()?;
        match self.part {
            SlotPart::High => Some(hi),
            SlotPart::Low => Some(lo),
            SlotPart::Whole => None,
        }
    }
}

/// Where one argument lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgEntry {
    /// The argument's IR identifier (`%0`, `%1`, ...).
    pub name: String,
    /// Register slots, first byte first.
    pub reg_slots: Vec<RegSlot>,
    /// Offset of the stack portion within the stack argument area.
    pub stack_off: u16,
    /// Size of the stack portion in bytes (0 when fully in registers).
    pub stack_bytes: u16,
}

impl ArgEntry {
    /// Total bytes of the argument, registers plus stack.
    pub fn total_bytes(&self) -> u16 {
        self.reg_slots.iter().map(|s| s.bytes()).sum::<u16>() + self.stack_bytes
    }
}

/// The argument-location map of one procedure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArgLocMap {
    /// One entry per argument, in declaration order.
    pub entries: Vec<ArgEntry>,
    /// Total size of the stack argument area in bytes.
    pub stack_size: u16,
}

impl ArgLocMap {
    /// Look an argument up by IR identifier.
    pub fn entry(&self, name: &str) -> Option<&ArgEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

/// Half-register availability mask.
///
/// One bit per allocatable 8-bit unit: A and both halves of BC, DE and HL.
/// The flags half of AF is never allocatable.
#[derive(Clone, Copy, Debug)]
struct HalfMask {
    avail: u8,
}

/// Bit number of each allocatable half.
fn half_bit(reg: Reg) -> u8 {
    match reg {
        Reg::A => 0,
        Reg::B => 1,
        Reg::C => 2,
        Reg::D => 3,
        Reg::E => 4,
        Reg::H => 5,
        Reg::L => 6,
    }
}

impl HalfMask {
    fn new() -> Self {
        Self { avail: 0x7f }
    }

    fn is_avail(&self, reg: Reg) -> bool {
        self.avail & (1 << half_bit(reg)) != 0
    }

    fn take(&mut self, reg: Reg) {
        debug_assert!(self.is_avail(reg), "{} not available", reg);
        self.avail &= !(1 << half_bit(reg));
    }

    /// Are both halves of the pair free?
    fn pair_avail(&self, pair: Reg16) -> bool {
        match pair.halves() {
            Some((hi, lo)) => self.is_avail(hi) && self.is_avail(lo),
            None => false,
        }
    }

    fn take_pair(&mut self, pair: Reg16) {
        let (hi, lo) = pair.halves().expect("pair with halves");
        self.take(hi);
        self.take(lo);
    }
}

/// The ordered pool of 8-bit argument registers.
const BYTE_POOL: [Reg; 7] = [Reg::A, Reg::B, Reg::C, Reg::D, Reg::E, Reg::H, Reg::L];

/// The ordered pool of 16-bit argument register pairs.
const PAIR_POOL: [Reg16; 3] = [Reg16::HL, Reg16::DE, Reg16::BC];

/// The pair a half register belongs to, as a slot.
fn half_slot(reg: Reg) -> RegSlot {
    match reg {
        Reg::A => RegSlot {
            reg: Reg16::AF,
            part: SlotPart::High,
        },
        Reg::B => RegSlot {
            reg: Reg16::BC,
            part: SlotPart::High,
        },
        Reg::C => RegSlot {
            reg: Reg16::BC,
            part: SlotPart::Low,
        },
        Reg::D => RegSlot {
            reg: Reg16::DE,
            part: SlotPart::High,
        },
        Reg::E => RegSlot {
            reg: Reg16::DE,
            part: SlotPart::Low,
        },
        Reg::H => RegSlot {
            reg: Reg16::HL,
            part: SlotPart::High,
        },
        Reg::L => RegSlot {
            reg: Reg16::HL,
            part: SlotPart::Low,
        },
    }
}

/// Compute the argument-location map for a procedure.
///
/// `args` is the ordered list of `(IR identifier, byte size)` pairs;
/// `variadic_from` is the index of the first variadic position, when the
/// procedure is variadic. The mask of used register halves is local to this
/// one run.
pub fn allocate_args(args: &[(String, u64)], variadic_from: Option<usize>) -> ArgLocMap {
    let mut mask = HalfMask::new();
    let mut map = ArgLocMap::default();
    let mut stack_off: u16 = 0;

    for (index, (name, size)) in args.iter().enumerate() {
        let mut entry = ArgEntry {
            name: name.clone(),
            reg_slots: Vec::new(),
            stack_off,
            stack_bytes: 0,
        };
        let mut bytes = *size as u16;
        let variadic = variadic_from.is_some_and(|cut| index >= cut);

        if !variadic {
            if bytes == 1 {
                if let Some(reg) = BYTE_POOL.iter().copied().find(|r| mask.is_avail(*r)) {
                    mask.take(reg);
                    entry.reg_slots.push(half_slot(reg));
                    bytes = 0;
                }
            } else {
                while bytes >= 2 {
                    match PAIR_POOL.iter().copied().find(|p| mask.pair_avail(*p)) {
                        Some(pair) => {
                            mask.take_pair(pair);
                            entry.reg_slots.push(RegSlot {
                                reg: pair,
                                part: SlotPart::Whole,
                            });
                            bytes -= 2;
                        }
                        None => break,
                    }
                }
            }
        }

        // The residue goes to the stack.
        entry.stack_off = stack_off;
        entry.stack_bytes = bytes;
        stack_off += bytes;
        map.entries.push(entry);
    }
    map.stack_size = stack_off;
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(sizes: &[u64]) -> Vec<(String, u64)> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, s)| (format!("%{}", i), *s))
            .collect()
    }

    #[test]
    fn two_int_arguments() {
        let map = allocate_args(&named(&[2, 2]), None);
        assert_eq!(
            map.entries[0].reg_slots,
            vec![RegSlot {
                reg: Reg16::HL,
                part: SlotPart::Whole
            }]
        );
        assert_eq!(
            map.entries[1].reg_slots,
            vec![RegSlot {
                reg: Reg16::DE,
                part: SlotPart::Whole
            }]
        );
        assert_eq!(map.stack_size, 0);
    }

    #[test]
    fn byte_arguments_claim_halves() {
        let map = allocate_args(&named(&[1, 1, 1]), None);
        let regs: Vec<_> = map
            .entries
            .iter()
            .map(|e| e.reg_slots[0].half_reg())
            .collect();
        assert_eq!(map.entries[0].reg_slots[0].reg, Reg16::AF);
        assert_eq!(regs[0], Some(Reg::A));
        assert_eq!(regs[1], Some(Reg::B));
        assert_eq!(regs[2], Some(Reg::C));
    }

    #[test]
    fn split_pair_is_not_a_pair() {
        // The byte claims A; the next claims B, splitting BC, and HL/DE
        // remain the only whole pairs.
        let map = allocate_args(&named(&[1, 1, 2, 2, 2]), None);
        assert_eq!(map.entries[2].reg_slots[0].reg, Reg16::HL);
        assert_eq!(map.entries[3].reg_slots[0].reg, Reg16::DE);
        // BC is split in half by the second byte argument, so the last
        // argument goes to the stack.
        assert!(map.entries[4].reg_slots.is_empty());
        assert_eq!(map.entries[4].stack_bytes, 2);
        assert_eq!(map.stack_size, 2);
    }

    #[test]
    fn wide_argument_spans_pairs_and_stack() {
        let map = allocate_args(&named(&[8]), None);
        let e = &map.entries[0];
        assert_eq!(e.reg_slots.len(), 3);
        assert_eq!(e.reg_slots[0].reg, Reg16::HL);
        assert_eq!(e.reg_slots[1].reg, Reg16::DE);
        assert_eq!(e.reg_slots[2].reg, Reg16::BC);
        assert_eq!(e.stack_bytes, 2);
        assert_eq!(map.stack_size, 2);
    }

    #[test]
    fn odd_sized_residue() {
        // 3 bytes: one pair, one stack byte.
        let map = allocate_args(&named(&[3]), None);
        let e = &map.entries[0];
        assert_eq!(e.reg_slots.len(), 1);
        assert_eq!(e.stack_bytes, 1);
    }

    #[test]
    fn variadic_args_all_on_stack() {
        let map = allocate_args(&named(&[2, 2, 2]), Some(1));
        assert_eq!(map.entries[0].reg_slots.len(), 1);
        assert!(map.entries[1].reg_slots.is_empty());
        assert!(map.entries[2].reg_slots.is_empty());
        assert_eq!(map.entries[1].stack_off, 0);
        assert_eq!(map.entries[2].stack_off, 2);
        assert_eq!(map.stack_size, 4);
    }

    #[test]
    fn totality() {
        // Reconstructing each argument from its slots yields the declared
        // byte counts exactly.
        let sizes = [2u64, 1, 4, 8, 1, 2, 2];
        let map = allocate_args(&named(&sizes), None);
        for (e, size) in map.entries.iter().zip(&sizes) {
            assert_eq!(e.total_bytes() as u64, *size, "{:?}", e);
        }
        // Stack portions are contiguous and in order.
        let mut off = 0;
        for e in &map.entries {
            if e.stack_bytes > 0 {
                assert_eq!(e.stack_off, off);
                off += e.stack_bytes;
            }
        }
        assert_eq!(off, map.stack_size);
    }

    #[test]
    fn lookup_by_name() {
        let map = allocate_args(&named(&[2, 2]), None);
        assert!(map.entry("%1").is_some());
        assert!(map.entry("%9").is_none());
    }
}
