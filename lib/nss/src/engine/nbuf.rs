// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Network buffers handed across the rings.

use super::Error;
use super::Result;

/// A buffer owned by whichever side of a ring currently holds it.
///
/// Ownership moves into the ring on enqueue and back out on dequeue;
/// a buffer is never reachable from both sides at once.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Nbuf {
    data: Vec<u8>,
    vlan_tci: Option<u16>,
}

impl Nbuf {
    /// Allocate an empty buffer able to hold `cap` bytes.
    ///
    /// Allocation failure is reported rather than aborting, so that
    /// callers on the receive path can degrade by dropping work.
    pub fn alloc(cap: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(cap).map_err(|_| Error::NoMem)?;
        Ok(Self { data, vlan_tci: None })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut nbuf = Self::alloc(bytes.len())?;
        nbuf.data.extend_from_slice(bytes);
        Ok(nbuf)
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, vlan_tci: None }
    }

    pub fn with_vlan(mut self, tci: u16) -> Self {
        self.vlan_tci = Some(tci);
        self
    }

    pub fn vlan_tci(&self) -> Option<u16> {
        self.vlan_tci
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Append the contents of another segment.
    pub fn append(&mut self, seg: &[u8]) -> Result<()> {
        self.data.try_reserve(seg.len()).map_err(|_| Error::NoMem)?;
        self.data.extend_from_slice(seg);
        Ok(())
    }

    /// Drop the contents, keeping the allocation for reuse.
    pub fn reset(&mut self) {
        self.data.clear();
        self.vlan_tci = None;
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}
