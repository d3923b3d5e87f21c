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

// src/shutdown.rs
// Fleet-wide shutdown coordination. Quit latches `running` to false; from
// there every worker walks two barriers: first all workers queue the wills
// of their clients, then all workers send protocol DISCONNECTs and close.
// Workers keep servicing I/O between the barriers, which is what gets a
// departing client's will delivered to subscribers that are themselves
// about to be disconnected.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub struct ShutdownCoordinator {
    workers: usize,
    running: AtomicBool,
    wills_queued: AtomicUsize,
    disconnects_sent: AtomicUsize,
}

impl ShutdownCoordinator {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            running: AtomicBool::new(true),
            wills_queued: AtomicUsize::new(0),
            disconnects_sent: AtomicUsize::new(0),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // Latch the quit flag. Returns true for the caller that actually
    // flipped it, so the event gets logged once.
    pub fn request_quit(&self) -> bool {
        self.running.swap(false, Ordering::AcqRel)
    }

    // Called once per worker after it queued every pending will.
    pub fn note_wills_queued(&self) {
        self.wills_queued.fetch_add(1, Ordering::AcqRel);
    }

    pub fn all_wills_queued(&self) -> bool {
        self.wills_queued.load(Ordering::Acquire) >= self.workers
    }

    // Called once per worker after it sent DISCONNECT frames to every
    // still-connected client.
    pub fn note_disconnects_sent(&self) {
        self.disconnects_sent.fetch_add(1, Ordering::AcqRel);
    }

    pub fn all_disconnects_sent(&self) -> bool {
        self.disconnects_sent.load(Ordering::Acquire) >= self.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_latches_once() {
        let coordinator = ShutdownCoordinator::new(2);
        assert!(coordinator.is_running());
        assert!(coordinator.request_quit());
        assert!(!coordinator.request_quit());
        assert!(!coordinator.is_running());
    }

    #[test]
    fn barriers_wait_for_every_worker() {
        let coordinator = ShutdownCoordinator::new(3);
        assert!(!coordinator.all_wills_queued());

        coordinator.note_wills_queued();
        coordinator.note_wills_queued();
        assert!(!coordinator.all_wills_queued());
        coordinator.note_wills_queued();
        assert!(coordinator.all_wills_queued());

        coordinator.note_disconnects_sent();
        assert!(!coordinator.all_disconnects_sent());
        coordinator.note_disconnects_sent();
        coordinator.note_disconnects_sent();
        assert!(coordinator.all_disconnects_sent());
    }
}
