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

// src/worker/tasks.rs
// The cross-thread task queue: the only write channel into a worker.
// post() appends under the mutex; the owning worker drains by swapping the
// whole list out and running entries without the lock, so producers are
// never blocked behind task execution. Tasks posted while a drain is
// running land in the next iteration, which bounds per-iteration work.
//
// Ordering is FIFO per producer; no ordering is promised across producers.

use parking_lot::Mutex;

use crate::worker::ThreadCore;

// A deferred closure executed on the owning worker. It receives the
// worker so it can register clients, touch settings, and so on.
pub type Task = Box<dyn FnOnce(&mut ThreadCore) + Send + 'static>;

pub struct TaskQueue<T = Task> {
    entries: Mutex<Vec<T>>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    // Append an entry. Returns whether the queue was empty, which is what
    // callers use to decide nothing extra is needed beyond the (coalesced)
    // wakeup signal.
    pub fn post(&self, entry: T) -> bool {
        let mut entries = self.entries.lock();
        let was_empty = entries.is_empty();
        entries.push(entry);
        was_empty
    }

    // Swap the current list out. Only the owning worker calls this.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
