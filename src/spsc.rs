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

use crossbeam_queue::ArrayQueue;
use mio::Waker;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Producing side of the acceptor→worker hand-off: a bounded lock-free
/// queue of raw fds paired with the worker's wake handle. The protocol is
/// push then nudge; a nudge with nothing queued is benign on the other
/// side. Ownership of an fd passes to the worker only on a successful
/// push.
pub struct FdSender {
    queue: Arc<ArrayQueue<RawFd>>,
    waker: Arc<Waker>,
}

impl FdSender {
    /// Queue an fd for the worker. On a full queue the fd is handed back
    /// and the caller remains responsible for closing it.
    pub fn try_send(&self, fd: RawFd) -> Result<(), RawFd> {
        self.queue.push(fd)
    }

    /// Wake the worker's event loop.
    pub fn nudge(&self) -> Result<(), io::Error> {
        self.waker.wake()
    }
}

pub struct FdReceiver {
    queue: Arc<ArrayQueue<RawFd>>,
}

impl FdReceiver {
    pub fn try_recv(&self) -> Option<RawFd> {
        self.queue.pop()
    }
}

pub fn fd_channel(capacity: usize, waker: Arc<Waker>) -> (FdSender, FdReceiver) {
    let queue = Arc::new(ArrayQueue::new(capacity));

    let sender = FdSender {
        queue: Arc::clone(&queue),
        waker,
    };

    let receiver = FdReceiver { queue };

    (sender, receiver)
}
