/*
 * Copyright (C) 2024-2025 Spindle Developers
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::cmp;
use std::io;
use std::sync::Arc;
use std::time::Duration;

const EVENTS_MAX: usize = 1024;

/// The wake token is reserved for the nudge channel; connection tokens are
/// offset past it.
pub const WAKE_TOKEN: Token = Token(0);

const TOKEN_BASE: usize = 1;

pub fn token_for(key: usize) -> Token {
    Token(key + TOKEN_BASE)
}

pub fn key_for(token: Token) -> usize {
    token.0 - TOKEN_BASE
}

/// Readiness multiplexer for one worker. Wraps the OS facility and its
/// wake handle; sockets are registered read-side edge-triggered initially
/// and flipped between read-side and write-side interest as their drivers
/// require.
pub struct Poller {
    poll: Poll,
}

impl Poller {
    pub fn new() -> Result<(Poller, Arc<Waker>), io::Error> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        Ok((Self { poll }, waker))
    }

    /// Event storage sized to the worker's connection capacity, capped.
    pub fn events(maxconn: usize) -> Events {
        Events::with_capacity(cmp::max(cmp::min(maxconn, EVENTS_MAX), 1))
    }

    pub fn register_read(&self, sock: &mut TcpStream, key: usize) -> Result<(), io::Error> {
        self.poll
            .registry()
            .register(sock, token_for(key), Interest::READABLE)
    }

    pub fn set_interest(
        &self,
        sock: &mut TcpStream,
        key: usize,
        write: bool,
    ) -> Result<(), io::Error> {
        let interest = if write {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        self.poll
            .registry()
            .reregister(sock, token_for(key), interest)
    }

    pub fn deregister(&self, sock: &mut TcpStream) -> Result<(), io::Error> {
        self.poll.registry().deregister(sock)
    }

    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> Result<(), io::Error> {
        self.poll.poll(events, timeout)
    }

    pub fn is_hangup(event: &Event) -> bool {
        event.is_read_closed() || event.is_write_closed()
    }
}
