/*
 * SPDX-FileCopyrightText: Copyright (c) 2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

// src/counters.rs
// Lock-free monotonic counters. Each worker owns one WorkerCounters and is
// the only writer; any thread may read them with a plain atomic load (the
// stats lead does exactly that when it aggregates the fleet).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// DerivableCounter is a monotonically increasing counter that can also
// answer "how fast is this growing" at stats-tick boundaries. The rate is
// derived from the delta against the previous sample, which is stored
// inside the counter so callers don't have to keep bookkeeping around.
#[derive(Debug, Default)]
pub struct DerivableCounter {
    value: AtomicU64,
    last_sample: AtomicU64,
}

impl DerivableCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    // derive_per_second samples the counter and returns the growth rate
    // since the previous sample. Only the owning worker calls this, at its
    // stats tick; concurrent increments between the two loads just land in
    // the next window.
    pub fn derive_per_second(&self, elapsed: Duration) -> u64 {
        let current = self.get();
        let previous = self.last_sample.swap(current, Ordering::Relaxed);
        let delta = current.saturating_sub(previous);
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0;
        }
        (delta as f64 / secs).round() as u64
    }
}

// WorkerCounters groups the per-worker statistics the $SYS publisher
// aggregates: message traffic, connect and disconnect totals.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub messages_received: DerivableCounter,
    pub messages_sent: DerivableCounter,
    pub connects: DerivableCounter,
    pub disconnects: DerivableCounter,
}

impl WorkerCounters {
    pub fn new() -> Self {
        Self::default()
    }
}
