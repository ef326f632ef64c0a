// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executive configuration.
//!
//! Every budget the design leaves platform-tunable lives here, with the
//! host-class defaults. The CLI deserialises this from a TOML file; tests
//! construct it directly.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Instructions driven per scheduler slice.
    pub quantum: u32,
    /// Microseconds of kernel time one tick represents. Kernel time is
    /// virtual: it advances per tick, which keeps timeout behavior
    /// reproducible under test.
    pub tick_us: u64,
    /// Maximum live tasks.
    pub max_tasks: usize,
    /// Mailbox table slots.
    pub mailbox_slots: usize,
    /// Aggregate mailbox capacity budget, bytes.
    pub mailbox_budget_bytes: usize,
    /// Registry entry budgets.
    pub max_values: usize,
    pub max_commands: usize,
    pub descriptor_pool_bytes: usize,
    pub string_pool_bytes: usize,
    /// Event ring capacity (droppable categories).
    pub event_ring: usize,
    /// Outstanding-ACK window before coalescing kicks in.
    pub event_ack_window: usize,
    /// Per-category events admitted per drain; excess coalesces.
    pub event_rate_limit: u64,
    /// Grace period for debug-session reconnects, in milliseconds.
    pub keepalive_grace_ms: u64,
    /// Async command executor worker threads.
    pub async_workers: usize,
    /// VM arena and cache sizes.
    pub code_line_bytes: u32,
    pub code_lines: usize,
    pub prefetch: bool,
    pub tlb_page_bytes: u32,
    pub tlb_entries: usize,
    pub reg_window_slots: usize,
    pub heap_bytes: u32,
    pub ipc_bytes: u32,
    pub stack_bytes: u32,
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            quantum: 128,
            tick_us: 100,
            max_tasks: 256,
            mailbox_slots: 64,
            mailbox_budget_bytes: 64 * 1024,
            max_values: 256,
            max_commands: 64,
            descriptor_pool_bytes: 4096,
            string_pool_bytes: 4096,
            event_ring: 256,
            event_ack_window: 32,
            event_rate_limit: 64,
            keepalive_grace_ms: 5000,
            async_workers: 2,
            code_line_bytes: 256,
            code_lines: 2,
            prefetch: true,
            tlb_page_bytes: 1024,
            tlb_entries: 4,
            reg_window_slots: 256,
            heap_bytes: 4096,
            ipc_bytes: 256,
            stack_bytes: 1024,
        }
    }
}

impl ExecConfig {
    pub fn vm_config(&self) -> hsx_vm::VmConfig {
        hsx_vm::VmConfig {
            code_line_bytes: self.code_line_bytes,
            code_lines: self.code_lines,
            prefetch: self.prefetch,
            tlb_page_bytes: self.tlb_page_bytes,
            tlb_entries: self.tlb_entries,
            reg_window_slots: self.reg_window_slots,
            heap_bytes: self.heap_bytes,
            ipc_bytes: self.ipc_bytes,
            stack_bytes: self.stack_bytes,
        }
    }
}
