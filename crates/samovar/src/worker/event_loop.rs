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

// src/worker/event_loop.rs
// Thin wrapper over the readiness multiplexer. Token(0) is reserved for
// the wakeup handle; client handles start above it. Waker signals coalesce
// at the OS level, so any number of cross-thread posts between two waits
// costs at most one extra iteration.

use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::errors::CoreError;

pub const WAKER_TOKEN: Token = Token(0);

const EVENTS_CAPACITY: usize = 1024;

// A readiness event, decoupled from the mio::Event borrow so the worker
// can mutate itself while dispatching.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReadyEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
}

pub(crate) struct Multiplexer {
    poll: Poll,
    events: Events,
}

impl Multiplexer {
    // Create the poll instance and its wakeup handle. The waker is
    // returned separately because it gets shared with every thread that
    // may post tasks to this worker.
    pub fn new() -> Result<(Self, Arc<Waker>), CoreError> {
        let poll = Poll::new().map_err(CoreError::multiplexer)?;
        let waker =
            Waker::new(poll.registry(), WAKER_TOKEN).map_err(CoreError::WakeupHandleLost)?;
        Ok((
            Self {
                poll,
                events: Events::with_capacity(EVENTS_CAPACITY),
            },
            Arc::new(waker),
        ))
    }

    // Add a connection with initial read interest.
    pub fn register(&self, stream: &mut TcpStream, token: Token) -> Result<(), CoreError> {
        self.poll
            .registry()
            .register(stream, token, Interest::READABLE)
            .map_err(CoreError::registration_failed)
    }

    // Adjust readiness interest. Used on the write buffer's empty and
    // non-empty transitions.
    pub fn modify_interest(
        &self,
        stream: &mut TcpStream,
        token: Token,
        read: bool,
        write: bool,
    ) -> Result<(), CoreError> {
        let interest = match (read, write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            // Read interest is the floor; a connection nobody reads from
            // would never notice its peer going away.
            _ => Interest::READABLE,
        };
        self.poll
            .registry()
            .reregister(stream, token, interest)
            .map_err(CoreError::registration_failed)
    }

    pub fn deregister(&self, stream: &mut TcpStream) -> Result<(), CoreError> {
        self.poll
            .registry()
            .deregister(stream)
            .map_err(CoreError::registration_failed)
    }

    // Block until readiness, a timer-bounded timeout, or a wakeup signal.
    // Fills `ready` with the decoupled events. EINTR is not an error, just
    // an empty round.
    pub fn wait(
        &mut self,
        timeout: Duration,
        ready: &mut Vec<ReadyEvent>,
    ) -> Result<(), CoreError> {
        ready.clear();
        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(CoreError::multiplexer(err));
        }
        for event in self.events.iter() {
            ready.push(ReadyEvent {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
                closed: event.is_read_closed() || event.is_write_closed(),
            });
        }
        Ok(())
    }
}
