/*
 * Copyright (C) 2024 The rlat authors
 *
 * This file is part of rlat.
 *
 * rlat is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * rlat is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with rlat.  If not, see <https://www.gnu.org/licenses/>.
 */

/// Pins the hot threads (client send/receive, server listeners) to cores in
/// round-robin order when enabled.
pub struct CpuAffinityManager {
    enabled: bool,
    cores: Vec<core_affinity::CoreId>,
    pos: usize,
}

impl CpuAffinityManager {
    pub fn new(enabled: bool) -> CpuAffinityManager {
        let cores = if enabled {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        if enabled && cores.is_empty() {
            log::warn!("thread pinning requested, but no core IDs are available");
        }
        CpuAffinityManager { enabled, cores, pos: 0 }
    }

    /// Pins the current thread to the next core in the rotation.
    pub fn set_affinity(&mut self) {
        if !self.enabled || self.cores.is_empty() {
            return;
        }
        let core = self.cores[self.pos];
        self.pos = (self.pos + 1) % self.cores.len();
        if core_affinity::set_for_current(core) {
            log::debug!("pinned thread to core {}", core.id);
        } else {
            log::warn!("unable to pin thread to core {}", core.id);
        }
    }
}
