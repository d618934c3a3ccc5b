// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The default instruction code table from RFC 3284 section 5.6.

use crate::address_cache::{NEAR_SLOTS, SAME_SLOTS};

/// Number of addressing modes available to COPY.
pub const MODES: u8 = 2 + NEAR_SLOTS as u8 + SAME_SLOTS as u8;

/// Opcode for an ADD whose size follows in the instruction section.
pub const ADD_EXPLICIT: u8 = 1;
/// Largest ADD size with a dedicated opcode.
pub const ADD_MAX_IMPLICIT: usize = 17;
/// COPY sizes with dedicated opcodes.
pub const COPY_IMPLICIT: std::ops::RangeInclusive<usize> = 4..=18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Noop,
    Add,
    Run,
    Copy(u8),
}

/// One half of a code table entry. A `size` of zero means the size is stored explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub kind: Kind,
    pub size: u8,
}

const NOOP: Instruction = Instruction {
    kind: Kind::Noop,
    size: 0,
};

pub struct CodeTable {
    entries: [[Instruction; 2]; 256],
}

impl CodeTable {
    pub fn get(&self, opcode: u8) -> &[Instruction; 2] {
        &self.entries[opcode as usize]
    }
}

impl Default for CodeTable {
    fn default() -> Self {
        let mut entries = [[NOOP; 2]; 256];
        let mut next = entries.iter_mut();
        let mut push = |first: Instruction, second: Instruction| {
            // 256 entries are pushed in total
            if let Some(entry) = next.next() {
                *entry = [first, second];
            }
        };
        let add = |size| Instruction {
            kind: Kind::Add,
            size,
        };
        let copy = |mode, size| Instruction {
            kind: Kind::Copy(mode),
            size,
        };

        push(
            Instruction {
                kind: Kind::Run,
                size: 0,
            },
            NOOP,
        );
        for size in 0..=ADD_MAX_IMPLICIT as u8 {
            push(add(size), NOOP);
        }
        for mode in 0..MODES {
            push(copy(mode, 0), NOOP);
            for size in COPY_IMPLICIT {
                push(copy(mode, size as u8), NOOP);
            }
        }
        for mode in 0..6 {
            for add_size in 1..=4 {
                for copy_size in 4..=6 {
                    push(add(add_size), copy(mode, copy_size));
                }
            }
        }
        for mode in 6..MODES {
            for add_size in 1..=4 {
                push(add(add_size), copy(mode, 4));
            }
        }
        for mode in 0..MODES {
            push(copy(mode, 4), add(1));
        }

        Self { entries }
    }
}

/// Opcode of a lone ADD of `size` bytes, and whether the size must be written explicitly.
pub fn add_opcode(size: usize) -> (u8, bool) {
    if (1..=ADD_MAX_IMPLICIT).contains(&size) {
        (ADD_EXPLICIT + size as u8, false)
    } else {
        (ADD_EXPLICIT, true)
    }
}

/// Opcode of a lone COPY of `size` bytes in `mode`, and whether the size must be written
/// explicitly.
pub fn copy_opcode(mode: u8, size: usize) -> (u8, bool) {
    let base = ADD_EXPLICIT + ADD_MAX_IMPLICIT as u8 + 1 + mode * 16;
    if COPY_IMPLICIT.contains(&size) {
        (base + (size - 3) as u8, false)
    } else {
        (base, true)
    }
}
