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

use crate::config::Config;
use crate::coro::{DeferStack, Yield};
use crate::datecache::DateCache;
use crate::expire::Expires;
use crate::request::{ProcessStatus, ProxyInfo, ReadBuffer, Request, RequestFlags, RequestProcessor};
use mio::net::TcpStream;
use std::ops::BitOr;

const RESPONSE_BUFFER_SIZE: usize = 4096;

/// Connection state bits.
///
/// `WRITE_EVENTS` tracks the interest currently installed in the
/// multiplexer: set means write-side readiness, clear means read-side
/// edge-triggered readiness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnFlags(u8);

impl ConnFlags {
    pub const IS_ALIVE: ConnFlags = ConnFlags(0x01);
    pub const KEEP_ALIVE: ConnFlags = ConnFlags(0x02);
    pub const SHOULD_RESUME: ConnFlags = ConnFlags(0x04);
    pub const MUST_READ: ConnFlags = ConnFlags(0x08);
    pub const WRITE_EVENTS: ConnFlags = ConnFlags(0x10);

    pub fn contains(self, other: ConnFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: ConnFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: ConnFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ConnFlags) {
        self.0 &= !other.0;
    }

    pub fn toggle(&mut self, other: ConnFlags) {
        self.0 ^= other.0;
    }
}

impl BitOr for ConnFlags {
    type Output = ConnFlags;

    fn bitor(self, other: ConnFlags) -> ConnFlags {
        ConnFlags(self.0 | other.0)
    }
}

/// One slot in a worker's connection table. The slot's key doubles as the
/// multiplexer token (offset by the wake token) and as the link value in
/// the expiry queue.
pub struct Connection {
    pub stream: TcpStream,
    pub flags: ConnFlags,
    pub time_to_die: u64,
    pub coro: Option<ConnCoro>,
}

impl Expires for Connection {
    fn time_to_die(&self) -> u64 {
        self.time_to_die
    }

    fn set_time_to_die(&mut self, t: u64) {
        self.time_to_die = t;
    }

    fn refreshable(&self) -> bool {
        self.flags
            .intersects(ConnFlags::KEEP_ALIVE | ConnFlags::SHOULD_RESUME)
    }
}

/// The resumable driver behind one connection. Each `resume` advances the
/// request loop by one step and yields back to the event loop: begin a
/// request, hand it to the processor, and on completion run the request's
/// deferred cleanups and carry the surviving flags into the next iteration.
///
/// Buffers live here so their storage spans every request on the
/// connection; the driver's drop runs any remaining cleanups.
pub struct ConnCoro {
    defers: DeferStack,
    response: Vec<u8>,
    buf: ReadBuffer,
    proxy: ProxyInfo,
    carried: RequestFlags,
    iter_flags: RequestFlags,
    cursor: Option<usize>,
    generation: usize,
    in_request: bool,
    started: bool,
}

impl ConnCoro {
    pub fn new() -> Self {
        Self {
            defers: DeferStack::new(),
            response: Vec::new(),
            buf: ReadBuffer::new(),
            proxy: ProxyInfo::default(),
            carried: RequestFlags::default(),
            iter_flags: RequestFlags::default(),
            cursor: None,
            generation: 0,
            in_request: false,
            started: false,
        }
    }

    pub fn resume<P>(
        &mut self,
        sock: &mut TcpStream,
        conn_flags: &mut ConnFlags,
        config: &Config,
        date: &DateCache,
        processor: &P,
    ) -> Yield
    where
        P: RequestProcessor,
    {
        if !self.started {
            if self.response.try_reserve(RESPONSE_BUFFER_SIZE).is_err() {
                return Yield::Abort;
            }

            self.started = true;
        }

        conn_flags.remove(ConnFlags::MUST_READ);

        if !self.in_request {
            // a pipelined followup parses out of the existing buffer
            if self.cursor.is_none() {
                self.buf.clear();
            }

            self.response.clear();

            let mut flags = self.carried;

            if config.proxy_protocol {
                flags.insert(RequestFlags::ALLOW_PROXY_REQS);
            }

            if config.allow_cors {
                flags.insert(RequestFlags::ALLOW_CORS);
            }

            self.iter_flags = flags;
            self.generation = self.defers.generation();
            self.in_request = true;
        }

        let mut req = Request::new(
            sock,
            &mut self.buf,
            &mut self.response,
            self.iter_flags,
            &mut self.proxy,
            date,
            conn_flags,
            &mut self.defers,
        );

        let status = processor.process(&mut req, self.cursor);

        self.iter_flags = req.flags;

        match status {
            ProcessStatus::NeedRead => {
                conn_flags.insert(ConnFlags::MUST_READ);

                Yield::MayResume
            }
            ProcessStatus::NeedWrite => Yield::MayResume,
            ProcessStatus::Done(next) => {
                self.defers.run(self.generation);

                self.carried = self.iter_flags.carried();
                self.cursor = next;
                self.in_request = false;

                Yield::MayResume
            }
            ProcessStatus::Failed => Yield::Abort,
        }
    }
}

impl Default for ConnCoro {
    fn default() -> Self {
        Self::new()
    }
}
