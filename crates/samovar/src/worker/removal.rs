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

// src/worker/removal.rs
// Deferred client destruction. Anything that wants a client gone posts a
// weak reference here; the loop drains the list after I/O handling, so a
// client is never torn down while readiness events or registry iterators
// still point at it. Entries for clients that are already gone resolve to
// nothing and are skipped.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::Client;

pub struct RemovalQueue {
    entries: Mutex<Vec<Weak<Client>>>,
}

impl RemovalQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn post(&self, client: &Arc<Client>) {
        self.entries.lock().push(Arc::downgrade(client));
    }

    pub fn drain(&self) -> Vec<Weak<Client>> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for RemovalQueue {
    fn default() -> Self {
        Self::new()
    }
}
