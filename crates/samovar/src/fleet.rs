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

// src/fleet.rs
// The worker fleet: N OS threads, each running one ThreadCore. The fleet
// is what an acceptor talks to: it assigns accepted connections round
// robin (skipping unhealthy workers), fans out reloads, and coordinates
// the two-barrier graceful shutdown. Workers never reach into each other;
// every cross-worker effect is a task posted on the target's queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use dashmap::DashMap;
use tracing::{error, info};

use crate::client::ConnectMeta;
use crate::config::Settings;
use crate::errors::CoreError;
use crate::shutdown::ShutdownCoordinator;
use crate::traits::Hooks;
use crate::worker::{Multiplexer, ThreadCore, WorkerShared};

// A connection the acceptor hands off: the socket plus what the
// connection handshake negotiated.
pub struct PendingConnection {
    pub stream: std::net::TcpStream,
    pub addr: SocketAddr,
    pub meta: ConnectMeta,
}

impl PendingConnection {
    pub fn new(stream: std::net::TcpStream, addr: SocketAddr, meta: ConnectMeta) -> Self {
        Self { stream, addr, meta }
    }
}

// Where a client id currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ClientLocation {
    pub worker: usize,
    pub token: usize,
}

// Fleet-wide client-id index. A connecting client id replaces the
// previous holder, and the replaced location gets evicted; stale entries
// are only removed by the worker that still owns them, so a takeover
// racing a disconnect cannot drop the newer claim.
pub(crate) struct ClientIdIndex {
    map: DashMap<String, ClientLocation>,
}

impl ClientIdIndex {
    fn new() -> Self {
        Self { map: DashMap::new() }
    }

    pub(crate) fn insert(
        &self,
        client_id: String,
        location: ClientLocation,
    ) -> Option<ClientLocation> {
        self.map.insert(client_id, location)
    }

    pub(crate) fn remove_entry(&self, client_id: &str, worker: usize, token: usize) {
        self.map
            .remove_if(client_id, |_, location| {
                location.worker == worker && location.token == token
            });
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, client_id: &str) -> bool {
        self.map.contains_key(client_id)
    }
}

// The slice of fleet state every worker carries: the quit coordinator,
// every worker's cross-thread face (for takeover tasks and stats
// aggregation) and the client-id index.
pub(crate) struct FleetState {
    pub(crate) coordinator: Arc<ShutdownCoordinator>,
    pub(crate) workers: Vec<Arc<WorkerShared>>,
    pub(crate) client_index: ClientIdIndex,
}

pub struct WorkerFleet {
    workers: Vec<Arc<WorkerShared>>,
    joins: Vec<JoinHandle<Result<(), CoreError>>>,
    coordinator: Arc<ShutdownCoordinator>,
    next: AtomicUsize,
}

impl WorkerFleet {
    // Spawn the workers. Worker count is fixed for the life of the fleet.
    pub fn start(workers: usize, settings: Settings, hooks: Hooks) -> Result<Self, CoreError> {
        let count = workers.max(1);
        let coordinator = Arc::new(ShutdownCoordinator::new(count));

        // Multiplexers and shared state first, so every worker can see
        // every peer before any thread runs.
        let mut muxes = Vec::with_capacity(count);
        let mut shareds = Vec::with_capacity(count);
        for id in 0..count {
            let (mux, waker) = Multiplexer::new()?;
            shareds.push(WorkerShared::new(id, waker));
            muxes.push(mux);
        }
        let fleet_state = Arc::new(FleetState {
            coordinator: Arc::clone(&coordinator),
            workers: shareds.clone(),
            client_index: ClientIdIndex::new(),
        });

        let mut joins = Vec::with_capacity(count);
        for (id, mux) in muxes.into_iter().enumerate() {
            let shared = Arc::clone(&shareds[id]);
            let fleet = Arc::clone(&fleet_state);
            let hooks = hooks.clone();
            let settings = settings.clone();
            let barrier_coordinator = Arc::clone(&coordinator);

            let spawned = std::thread::Builder::new()
                .name(format!("samovar-worker-{id}"))
                .spawn(move || match ThreadCore::new(shared.clone(), fleet, mux, hooks, settings) {
                    Ok(mut core) => core.run_until_quit(),
                    Err(err) => {
                        error!(worker = id, error = %err, "worker failed to start");
                        shared.mark_unhealthy();
                        // Do not strand peers at the shutdown barriers.
                        barrier_coordinator.note_wills_queued();
                        barrier_coordinator.note_disconnects_sent();
                        Err(err)
                    }
                });
            match spawned {
                Ok(join) => joins.push(join),
                Err(err) => {
                    // Unwind the partially started fleet: account for the
                    // workers that will never walk the barriers, then quit
                    // and reap the ones that did start.
                    coordinator.request_quit();
                    for _ in id..count {
                        coordinator.note_wills_queued();
                        coordinator.note_disconnects_sent();
                    }
                    for worker in &shareds {
                        worker.wake();
                    }
                    for join in joins {
                        let _ = join.join();
                    }
                    return Err(CoreError::ThreadStart(err));
                }
            }
        }

        info!(workers = count, "worker fleet started");
        Ok(Self {
            workers: shareds,
            joins,
            coordinator,
            next: AtomicUsize::new(0),
        })
    }

    // Hand an accepted connection to a worker, round robin. The chosen
    // worker installs it from its own task drain, which makes the client
    // visible to that same loop iteration.
    pub fn assign(&self, conn: PendingConnection) -> Result<(), CoreError> {
        if !self.coordinator.is_running() {
            return Err(CoreError::ShuttingDown);
        }
        let count = self.workers.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let target = (0..count)
            .map(|offset| (start + offset) % count)
            .find(|idx| self.workers[*idx].is_healthy());
        let Some(idx) = target else {
            return Err(CoreError::NoHealthyWorkers);
        };
        self.workers[idx].post(Box::new(move |core| core.install_client(conn)));
        Ok(())
    }

    // Ask every worker to quit. The loops exit once all of them have
    // queued their wills and sent their DISCONNECT frames.
    pub fn queue_quit(&self) {
        for worker in &self.workers {
            worker.post(Box::new(|core| {
                if core.fleet().coordinator.request_quit() {
                    info!(worker = core.worker_id(), "quit requested");
                }
            }));
        }
    }

    // Fan a new settings value out to every worker. Each applies it
    // atomically at its next loop iteration.
    pub fn queue_reload(&self, settings: Settings) {
        for worker in &self.workers {
            worker.queue_reload(settings.clone());
        }
    }

    pub fn is_running(&self) -> bool {
        self.coordinator.is_running()
    }

    pub fn workers(&self) -> &[Arc<WorkerShared>] {
        &self.workers
    }

    pub fn client_count(&self) -> usize {
        self.workers.iter().map(|w| w.client_count()).sum()
    }

    // Wait for every worker to exit; the first failure wins.
    pub fn join(self) -> Result<(), CoreError> {
        let mut first_error = None;
        for join in self.joins {
            match join.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(CoreError::WorkerPanicked);
                    }
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // Graceful stop: quit plus join.
    pub fn shutdown(self) -> Result<(), CoreError> {
        self.queue_quit();
        self.join()
    }
}
