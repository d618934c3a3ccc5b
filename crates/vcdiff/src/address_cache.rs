// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! COPY address compression (RFC 3284 section 5.3), using the default cache sizes.

use crate::varint::{self, VarintError};

pub const NEAR_SLOTS: usize = 4;
pub const SAME_SLOTS: usize = 3;

const MODE_SELF: u8 = 0;
const MODE_HERE: u8 = 1;
const FIRST_NEAR: u8 = 2;
const FIRST_SAME: u8 = FIRST_NEAR + NEAR_SLOTS as u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("address section is truncated")]
    Truncated,
    #[error("address mode {0} does not exist")]
    BadMode(u8),
    #[error("address {address} is not before current position {here}")]
    OutOfRange { address: u64, here: u64 },
}

impl From<VarintError> for AddressError {
    fn from(_: VarintError) -> Self {
        AddressError::Truncated
    }
}

pub struct AddressCache {
    near: [u64; NEAR_SLOTS],
    next_near: usize,
    same: [u64; SAME_SLOTS * 256],
}

impl AddressCache {
    pub fn new() -> Self {
        Self {
            near: [0; NEAR_SLOTS],
            next_near: 0,
            same: [0; SAME_SLOTS * 256],
        }
    }

    fn update(&mut self, address: u64) {
        self.near[self.next_near] = address;
        self.next_near = (self.next_near + 1) % NEAR_SLOTS;
        self.same[(address % (SAME_SLOTS as u64 * 256)) as usize] = address;
    }

    /// Chooses the cheapest mode for `address` and appends its encoding to `out`.
    pub fn encode(&mut self, address: u64, here: u64, out: &mut Vec<u8>) -> u8 {
        let same_slot = (address % (SAME_SLOTS as u64 * 256)) as usize;
        if self.same[same_slot] == address {
            self.update(address);
            out.push((same_slot % 256) as u8);
            return FIRST_SAME + (same_slot / 256) as u8;
        }

        let mut best = (MODE_SELF, address);
        let mut consider = |mode, value: u64| {
            if varint::len(value) < varint::len(best.1) {
                best = (mode, value);
            }
        };
        consider(MODE_HERE, here - address);
        for (slot, &near) in self.near.iter().enumerate() {
            if address >= near {
                consider(FIRST_NEAR + slot as u8, address - near);
            }
        }

        self.update(address);
        varint::write(best.1, out);
        best.0
    }

    /// Reads the address for a COPY in `mode` from `section`.
    pub fn decode(
        &mut self,
        mode: u8,
        here: u64,
        section: &[u8],
        pos: &mut usize,
    ) -> Result<u64, AddressError> {
        let address = match mode {
            MODE_SELF => varint::read(section, pos)?,
            MODE_HERE => here
                .checked_sub(varint::read(section, pos)?)
                .ok_or(AddressError::OutOfRange { address: 0, here })?,
            m if m < FIRST_SAME => {
                let offset = varint::read(section, pos)?;
                self.near[(m - FIRST_NEAR) as usize].saturating_add(offset)
            }
            m if m < FIRST_SAME + SAME_SLOTS as u8 => {
                let byte = *section.get(*pos).ok_or(AddressError::Truncated)?;
                *pos += 1;
                self.same[(m - FIRST_SAME) as usize * 256 + byte as usize]
            }
            m => return Err(AddressError::BadMode(m)),
        };
        if address >= here {
            return Err(AddressError::OutOfRange { address, here });
        }
        self.update(address);
        Ok(address)
    }
}
