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

// src/worker/registry.rs
// Handle -> Client map of one worker. The mutex serializes insertion (from
// acceptor-posted tasks) against the loop's own lookups, and lets foreign
// threads read counts for statistics. Outside the narrow window inside the
// worker's teardown, the key set here equals the set of handles registered
// with the worker's multiplexer.

use std::sync::Arc;

use mio::Token;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::client::Client;
use crate::errors::CoreError;

pub struct ClientRegistry {
    clients: Mutex<FxHashMap<usize, Arc<Client>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(FxHashMap::default()),
        }
    }

    // Insert a freshly registered client. The handle must be new.
    pub fn give_client(&self, client: Arc<Client>) -> Result<(), CoreError> {
        let token = client.handle();
        let mut clients = self.clients.lock();
        if clients.contains_key(&token.0) {
            return Err(CoreError::DuplicateHandle(token.0));
        }
        clients.insert(token.0, client);
        Ok(())
    }

    pub fn get(&self, token: Token) -> Option<Arc<Client>> {
        self.clients.lock().get(&token.0).cloned()
    }

    // Drop a client from the map. Idempotent: removing an absent handle
    // returns None and changes nothing.
    pub fn remove(&self, token: Token) -> Option<Arc<Client>> {
        self.clients.lock().remove(&token.0)
    }

    pub fn count(&self) -> usize {
        self.clients.lock().len()
    }

    // All current clients, for iteration that must not hold the lock
    // (will queueing, shutdown disconnects).
    pub fn snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.lock().values().cloned().collect()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}
