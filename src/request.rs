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

use crate::conn::ConnFlags;
use crate::coro::DeferStack;
use crate::datecache::DateCache;
use mio::net::TcpStream;
use std::io;
use std::io::Read;
use std::net::SocketAddr;
use std::ops::BitOr;

const READ_CHUNK_SIZE: usize = 4096;

/// Per-request state bits. `PROXIED` and `ALLOW_CORS` survive across
/// keep-alive iterations on the same connection; everything else is
/// recomputed from server settings at the start of each request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags(u32);

impl RequestFlags {
    pub const ALLOW_PROXY_REQS: RequestFlags = RequestFlags(0x01);
    pub const ALLOW_CORS: RequestFlags = RequestFlags(0x02);
    pub const PROXIED: RequestFlags = RequestFlags(0x04);

    const CARRY_MASK: u32 = Self::PROXIED.0 | Self::ALLOW_CORS.0;

    pub fn contains(self, other: RequestFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RequestFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: RequestFlags) {
        self.0 &= !other.0;
    }

    /// The subset carried over to the next request on this connection.
    pub fn carried(self) -> RequestFlags {
        RequestFlags(self.0 & Self::CARRY_MASK)
    }
}

impl BitOr for RequestFlags {
    type Output = RequestFlags;

    fn bitor(self, other: RequestFlags) -> RequestFlags {
        RequestFlags(self.0 | other.0)
    }
}

/// Peer addresses recovered from a PROXY protocol preamble, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyInfo {
    pub from: Option<SocketAddr>,
    pub to: Option<SocketAddr>,
}

/// Inbound bytes accumulated for a connection. The buffer only grows while
/// a request (and any pipelined followups) is being parsed, so offsets into
/// it remain stable until it is cleared between request cycles.
pub struct ReadBuffer {
    data: Vec<u8>,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Read once from the socket, appending to the buffer. Returns the
    /// number of bytes read; 0 means the peer closed the connection.
    pub fn fill_from(&mut self, sock: &mut TcpStream) -> Result<usize, io::Error> {
        let mut chunk = [0; READ_CHUNK_SIZE];

        let size = sock.read(&mut chunk)?;
        self.data.extend_from_slice(&chunk[..size]);

        Ok(size)
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// What the processor wants the reactor to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The current request is complete. Carries the offset of a pipelined
    /// followup request already sitting in the read buffer, if any.
    Done(Option<usize>),

    /// More inbound bytes are needed; wait for readability.
    NeedRead,

    /// The socket write side is full; wait for writability.
    NeedWrite,

    /// The connection is beyond saving.
    Failed,
}

/// Everything a processor sees while handling one request on a connection.
pub struct Request<'a> {
    pub sock: &'a mut TcpStream,
    pub buf: &'a mut ReadBuffer,
    pub response: &'a mut Vec<u8>,
    pub flags: RequestFlags,
    pub proxy: &'a mut ProxyInfo,
    pub date: &'a DateCache,
    conn_flags: &'a mut ConnFlags,
    defers: &'a mut DeferStack,
}

impl<'a> Request<'a> {
    pub(crate) fn new(
        sock: &'a mut TcpStream,
        buf: &'a mut ReadBuffer,
        response: &'a mut Vec<u8>,
        flags: RequestFlags,
        proxy: &'a mut ProxyInfo,
        date: &'a DateCache,
        conn_flags: &'a mut ConnFlags,
        defers: &'a mut DeferStack,
    ) -> Self {
        Self {
            sock,
            buf,
            response,
            flags,
            proxy,
            date,
            conn_flags,
            defers,
        }
    }

    /// Mark the connection as reusable for a followup request.
    pub fn set_keep_alive(&mut self, on: bool) {
        if on {
            self.conn_flags.insert(ConnFlags::KEEP_ALIVE);
        } else {
            self.conn_flags.remove(ConnFlags::KEEP_ALIVE);
        }
    }

    /// Register a cleanup scoped to the current request. It runs when the
    /// request completes, or when the connection is torn down, whichever
    /// comes first.
    pub fn defer<F>(&mut self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.defers.defer(f);
    }
}

/// The external request handler: parsing, dispatch, and response
/// generation all live behind this seam. Implementations must use
/// non-blocking I/O on the request socket and report `NeedRead`/`NeedWrite`
/// instead of blocking; the reactor re-invokes them when the socket is
/// ready again.
pub trait RequestProcessor: Send + Sync + 'static {
    /// Handle one request on a connection. `start` is the offset into the
    /// read buffer where this request begins when it was pipelined behind
    /// the previous one; `None` means the request starts a fresh buffer.
    fn process(&self, req: &mut Request<'_>, start: Option<usize>) -> ProcessStatus;
}
