// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use bitflags::bitflags;

bitflags! {
    /// Access and memory-type attributes requested for a mapping.
    ///
    /// Formats translate these into their own descriptor encoding. A mapping that allows neither
    /// [`Prot::READ`] nor [`Prot::WRITE`] is never installed.
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct Prot: u32 {
        /// Allow device reads.
        const READ = 1 << 0;
        /// Allow device writes.
        const WRITE = 1 << 1;
        /// Access is coherent with the CPU caches.
        const CACHE = 1 << 2;
        /// Forbid instruction fetches.
        const NOEXEC = 1 << 3;
        /// Device memory (strongly ordered, uncached).
        const MMIO = 1 << 4;
        /// Only privileged accesses are allowed.
        const PRIV = 1 << 5;
    }
}

impl Prot {
    /// Returns `true` if a mapping with these attributes would be reachable at all.
    pub const fn is_accessible(&self) -> bool {
        self.intersects(Prot::READ.union(Prot::WRITE))
    }
}
