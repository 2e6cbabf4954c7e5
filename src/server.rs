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
use crate::request::RequestProcessor;
use crate::worker::Worker;
use log::debug;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

/// The worker pool and its control plane. `new` spawns every worker and
/// returns once all of them are waiting in their event loops, so the
/// acceptor may start handing sockets over immediately.
pub struct Server {
    workers: Vec<Worker>,
    barrier: Arc<Barrier>,
    next: AtomicUsize,
}

impl Server {
    pub fn new<P>(config: Config, processor: P) -> Result<Server, io::Error>
    where
        P: RequestProcessor,
    {
        let config = Arc::new(config);
        let processor = Arc::new(processor);

        // the pool plus the caller rendezvous here, once at startup and
        // once at shutdown
        let barrier = Arc::new(Barrier::new(config.workers + 1));

        let mut workers = Vec::with_capacity(config.workers);

        for id in 0..config.workers {
            workers.push(Worker::new(id, &config, &processor, &barrier)?);
        }

        barrier.wait();

        debug!("{} workers created and ready", workers.len());

        Ok(Self {
            workers,
            barrier,
            next: AtomicUsize::new(0),
        })
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    /// Hand a newly accepted socket to the pool, round-robin. On success a
    /// worker owns the fd and will close it; on failure the caller keeps
    /// ownership and must close it.
    pub fn add_client(&self, fd: RawFd) -> bool {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let worker = &self.workers[i];

        if !worker.add_client(fd) {
            return false;
        }

        worker.nudge();

        true
    }

    /// Stop every worker, destroying any connections still alive, and join
    /// the threads. Dropping the server does the same.
    pub fn shutdown(mut self) {
        self.stop_workers();
    }

    fn stop_workers(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        debug!("shutting down workers");

        for worker in &self.workers {
            worker.stop();
        }

        self.barrier.wait();

        let mut workers = mem::take(&mut self.workers);

        for worker in &mut workers {
            worker.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop_workers();
    }
}
