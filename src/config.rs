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

use std::thread;

/// Server-wide settings shared by every worker. Loading these from a file
/// or the command line is the embedder's concern.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads, each running its own event loop.
    pub workers: usize,

    /// Maximum simultaneous connections per worker. Also bounds the
    /// acceptor hand-off queue.
    pub maxconn: usize,

    /// Keep-alive window in seconds. A connection not refreshed within
    /// this many reaper ticks is recycled.
    pub keep_alive_timeout: u64,

    /// Offset in seconds applied to the cached "Expires" header value.
    pub expires: u64,

    /// Accept PROXY protocol preambles on inbound connections.
    pub proxy_protocol: bool,

    /// Allow cross-origin requests.
    pub allow_cors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            maxconn: 1024,
            keep_alive_timeout: 15,
            expires: 0,
            proxy_protocol: false,
            allow_cors: false,
        }
    }
}
