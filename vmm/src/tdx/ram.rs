// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum RamState {
    /// Left for the guest to accept.
    Unaccepted,
    /// Added by the host before the measurement is sealed.
    Added,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct RamRegion {
    pub address: u64,
    pub length: u64,
    pub state: RamState,
}

impl RamRegion {
    pub fn end(&self) -> u64 {
        self.address + self.length
    }

    fn contains(&self, address: u64, length: u64) -> bool {
        address >= self.address
            && address
                .checked_add(length)
                .is_some_and(|end| end <= self.end())
    }
}

/// Guest RAM of a trust domain and what the host did with it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RamRegions(Vec<RamRegion>);

impl RamRegions {
    /// Every extent starts unaccepted.
    pub fn from_extents(extents: &[(u64, u64)]) -> Self {
        RamRegions(
            extents
                .iter()
                .map(|&(address, length)| RamRegion {
                    address,
                    length,
                    state: RamState::Unaccepted,
                })
                .collect(),
        )
    }

    /// Marks `[address, address + length)` as added. The range must fall in
    /// a single unaccepted region, which gets split around it.
    pub fn accept(&mut self, address: u64, length: u64) -> Result<(), super::TdxError> {
        let conflict = || super::TdxError::RangeConflict(address, length);
        if length == 0 {
            return Err(conflict());
        }

        let index = self
            .0
            .iter()
            .position(|r| r.state == RamState::Unaccepted && r.contains(address, length))
            .ok_or_else(conflict)?;

        let region = self.0[index];
        let head = address - region.address;
        let tail = region.end() - (address + length);

        self.0[index] = RamRegion {
            address,
            length,
            state: RamState::Added,
        };
        if tail > 0 {
            self.0.push(RamRegion {
                address: address + length,
                length: tail,
                state: RamState::Unaccepted,
            });
        }
        if head > 0 {
            self.0.push(RamRegion {
                address: region.address,
                length: head,
                state: RamState::Unaccepted,
            });
        }

        Ok(())
    }

    /// Whether `[address, address + length)` lies inside guest RAM.
    pub fn find(&self, address: u64, length: u64) -> Option<&RamRegion> {
        self.0.iter().find(|r| r.contains(address, length))
    }

    pub fn sort(&mut self) {
        self.0.sort_by_key(|r| r.address);
    }

    pub fn iter(&self) -> impl Iterator<Item = &RamRegion> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
