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
use crate::conn::{ConnCoro, ConnFlags, Connection};
use crate::coro::Yield;
use crate::datecache::DateCache;
use crate::expire::ExpireQueue;
use crate::list;
use crate::poller::{self, Poller};
use crate::request::RequestProcessor;
use crate::spsc::{fd_channel, FdReceiver, FdSender};
use log::{debug, error};
use mio::net::TcpStream;
use slab::Slab;
use std::io;
use std::net::TcpStream as StdTcpStream;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

/// Handle to one worker thread. The thread owns its multiplexer, its
/// connection table, and its expiry queue; the handle is what the acceptor
/// and the control plane touch from outside.
pub struct Worker {
    thread: Option<thread::JoinHandle<()>>,
    sender: FdSender,
    stopping: Arc<AtomicBool>,
}

impl Worker {
    pub(crate) fn new<P>(
        id: usize,
        config: &Arc<Config>,
        processor: &Arc<P>,
        barrier: &Arc<Barrier>,
    ) -> Result<Worker, io::Error>
    where
        P: RequestProcessor,
    {
        debug!("worker {}: starting", id);

        let (poller, waker) = Poller::new()?;
        let (sender, receiver) = fd_channel(config.maxconn, waker);
        let stopping = Arc::new(AtomicBool::new(false));

        let thread = {
            let config = Arc::clone(config);
            let processor = Arc::clone(processor);
            let barrier = Arc::clone(barrier);
            let stopping = Arc::clone(&stopping);

            thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || {
                    let mut core = WorkerCore::new(id, poller, receiver, config, processor);

                    core.run(&barrier, &stopping);

                    debug!("worker {}: stopped", id);
                })?
        };

        Ok(Self {
            thread: Some(thread),
            sender,
            stopping,
        })
    }

    /// Queue a newly accepted socket for this worker. On success the
    /// worker takes ownership of the fd and will eventually close it; on
    /// failure (hand-off queue full) the caller keeps ownership and must
    /// close it. Call `nudge` afterward so the worker notices.
    pub fn add_client(&self, fd: RawFd) -> bool {
        match self.sender.try_send(fd) {
            Ok(()) => true,
            Err(fd) => {
                error!("worker hand-off queue full, rejecting fd {}", fd);

                false
            }
        }
    }

    /// Wake the worker's event loop.
    pub fn nudge(&self) {
        if let Err(e) = self.sender.nudge() {
            error!("worker nudge: {}", e);
        }
    }

    pub(crate) fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.nudge();
    }

    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

struct WorkerCore<P> {
    id: usize,
    poller: Poller,
    pending: FdReceiver,
    config: Arc<Config>,
    processor: Arc<P>,
    conns: Slab<list::Node<Connection>>,
    expire: ExpireQueue,
    date: DateCache,
}

impl<P> WorkerCore<P>
where
    P: RequestProcessor,
{
    fn new(
        id: usize,
        poller: Poller,
        pending: FdReceiver,
        config: Arc<Config>,
        processor: Arc<P>,
    ) -> Self {
        let maxconn = config.maxconn;
        let keep_alive_timeout = config.keep_alive_timeout;

        Self {
            id,
            poller,
            pending,
            config,
            processor,
            conns: Slab::with_capacity(maxconn),
            expire: ExpireQueue::new(keep_alive_timeout),
            date: DateCache::new(),
        }
    }

    fn run(&mut self, barrier: &Barrier, stopping: &AtomicBool) {
        let mut events = Poller::events(self.config.maxconn);

        debug!("worker {}: starting event loop", self.id);

        barrier.wait();

        loop {
            if let Err(e) = self.poller.poll(&mut events, self.expire.poll_timeout()) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                error!("worker {}: poll: {}", self.id, e);
                continue;
            }

            if stopping.load(Ordering::Acquire) {
                break;
            }

            if events.is_empty() {
                // quiescent interval: reap idle connections
                self.sweep();
                continue;
            }

            self.date.update(self.config.expires);

            for event in events.iter() {
                if event.token() == poller::WAKE_TOKEN {
                    self.accept_pending();
                    continue;
                }

                let key = poller::key_for(event.token());

                // the event may be for a connection already destroyed
                // earlier in this batch
                if !self.conns.contains(key) {
                    continue;
                }

                if Poller::is_hangup(event) {
                    self.destroy(key);
                    continue;
                }

                self.resume_if_needed(key);

                if self.conns.contains(key) {
                    self.expire.refresh(&mut self.conns, key);
                }
            }
        }

        barrier.wait();

        self.kill_all();
    }

    /// Drain the hand-off queue, installing each pending fd: register it
    /// for readability, bind a driver to it, and resume immediately so
    /// parsing can begin without waiting for another readiness event.
    fn accept_pending(&mut self) {
        while let Some(fd) = self.pending.try_recv() {
            let key = match self.install(fd) {
                Some(key) => key,
                None => continue,
            };

            self.resume_if_needed(key);
        }
    }

    fn install(&mut self, fd: RawFd) -> Option<usize> {
        // ownership of the fd arrives with it; dropping the stream on any
        // failure path below closes it
        let stream = unsafe { StdTcpStream::from_raw_fd(fd) };

        if let Err(e) = stream.set_nonblocking(true) {
            error!("worker {}: set nonblocking: {}", self.id, e);
            return None;
        }

        if let Err(e) = stream.set_nodelay(true) {
            error!("worker {}: set nodelay failed: {:?}", self.id, e);
        }

        let mut stream = TcpStream::from_std(stream);

        if self.conns.len() >= self.config.maxconn {
            error!(
                "worker {}: out of connection slots, dropping fd {}",
                self.id, fd
            );
            return None;
        }

        let entry = self.conns.vacant_entry();
        let key = entry.key();

        if let Err(e) = self.poller.register_read(&mut stream, key) {
            error!("worker {}: register fd {}: {}", self.id, fd, e);
            return None;
        }

        entry.insert(list::Node::new(Connection {
            stream,
            flags: ConnFlags::IS_ALIVE | ConnFlags::SHOULD_RESUME,
            time_to_die: 0,
            coro: Some(ConnCoro::new()),
        }));

        self.expire.insert(&mut self.conns, key);

        debug!("worker {}: conn {}: accepted fd {}", self.id, key, fd);

        Some(key)
    }

    /// Resume the connection's driver if it expects resumption, then bring
    /// the installed multiplexer interest in line with what the driver
    /// wants next.
    fn resume_if_needed(&mut self, key: usize) {
        let outcome = {
            let conn = &mut self.conns[key].value;

            if !conn.flags.contains(ConnFlags::SHOULD_RESUME) {
                return;
            }

            let mut coro = match conn.coro.take() {
                Some(coro) => coro,
                None => return,
            };

            let outcome = coro.resume(
                &mut conn.stream,
                &mut conn.flags,
                &self.config,
                &self.date,
                self.processor.as_ref(),
            );

            if outcome >= Yield::MayResume {
                conn.coro = Some(coro);
            }

            outcome
        };

        if outcome < Yield::MayResume {
            self.destroy(key);
            return;
        }

        let conn = &mut self.conns[key].value;

        let toward_read = if conn.flags.contains(ConnFlags::MUST_READ) {
            // a forced read rearms read-side interest unconditionally
            true
        } else {
            let should_resume = outcome == Yield::MayResume;

            if should_resume {
                conn.flags.insert(ConnFlags::SHOULD_RESUME);
            } else {
                conn.flags.remove(ConnFlags::SHOULD_RESUME);
            }

            let write_events = conn.flags.contains(ConnFlags::WRITE_EVENTS);

            // the installed interest already matches
            if should_resume == write_events {
                return;
            }

            write_events
        };

        // a failed modify leaves the interest stale; the connection is
        // recycled by timeout or a later event
        if let Err(e) = self.poller.set_interest(&mut conn.stream, key, !toward_read) {
            error!("worker {}: conn {}: set interest: {}", self.id, key, e);
        }

        conn.flags.toggle(ConnFlags::WRITE_EVENTS);
    }

    fn destroy(&mut self, key: usize) {
        self.expire.remove(&mut self.conns, key);

        let node = self.conns.remove(key);
        let mut conn = node.value;

        if let Err(e) = self.poller.deregister(&mut conn.stream) {
            debug!("worker {}: conn {}: deregister: {}", self.id, key, e);
        }

        // drop the driver first so its deferred cleanups run before the
        // stream drop closes the fd
        drop(conn.coro.take());

        debug!("worker {}: conn {}: destroyed", self.id, key);
    }

    fn sweep(&mut self) {
        self.expire.tick();

        while let Some(key) = self.expire.next_expired(&self.conns) {
            debug!("worker {}: conn {}: keep-alive timeout", self.id, key);
            self.destroy(key);
        }

        self.expire.settle();
    }

    fn kill_all(&mut self) {
        while let Some(key) = self.expire.front() {
            self.destroy(key);
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::request::{ProcessStatus, Request};
    use std::collections::VecDeque;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream as StdStream};
    use std::os::unix::io::IntoRawFd;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Echoes newline-terminated lines back to the peer, one request per
    /// line, marking every connection keep-alive.
    pub struct EchoProcessor;

    impl RequestProcessor for EchoProcessor {
        fn process(&self, req: &mut Request<'_>, start: Option<usize>) -> ProcessStatus {
            let start = start.unwrap_or(0);

            loop {
                let found = req.buf.as_slice()[start..]
                    .iter()
                    .position(|&b| b == b'\n');

                let end = match found {
                    Some(pos) => start + pos + 1,
                    None => match req.buf.fill_from(req.sock) {
                        Ok(0) => return ProcessStatus::Failed,
                        Ok(_) => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return ProcessStatus::NeedRead
                        }
                        Err(_) => return ProcessStatus::Failed,
                    },
                };

                let line = req.buf.as_slice()[start..end].to_vec();
                req.response.extend_from_slice(&line);

                match req.sock.write(req.response) {
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return ProcessStatus::NeedWrite
                    }
                    Err(_) => return ProcessStatus::Failed,
                }

                req.set_keep_alive(true);

                let next = if end < req.buf.len() { Some(end) } else { None };

                return ProcessStatus::Done(next);
            }
        }
    }

    /// Registers a per-request cleanup that bumps a counter, then waits
    /// for input forever. Used to observe teardown.
    pub struct DeferProbe {
        pub count: Arc<AtomicUsize>,
    }

    impl RequestProcessor for DeferProbe {
        fn process(&self, req: &mut Request<'_>, _start: Option<usize>) -> ProcessStatus {
            let count = Arc::clone(&self.count);

            req.defer(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });

            ProcessStatus::NeedRead
        }
    }

    /// Consumes input without ever finishing a request.
    pub struct SilentProcessor;

    impl RequestProcessor for SilentProcessor {
        fn process(&self, req: &mut Request<'_>, _start: Option<usize>) -> ProcessStatus {
            match req.buf.fill_from(req.sock) {
                Ok(0) => ProcessStatus::Failed,
                Ok(_) => ProcessStatus::NeedRead,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => ProcessStatus::NeedRead,
                Err(_) => ProcessStatus::Failed,
            }
        }
    }

    struct ScriptProcessor {
        script: Mutex<VecDeque<ProcessStatus>>,
    }

    impl ScriptProcessor {
        fn new(script: Vec<ProcessStatus>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    impl RequestProcessor for ScriptProcessor {
        fn process(&self, _req: &mut Request<'_>, _start: Option<usize>) -> ProcessStatus {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ProcessStatus::NeedRead)
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            workers: 1,
            maxconn: 16,
            keep_alive_timeout: 5,
            ..Config::default()
        })
    }

    fn core_with<P: RequestProcessor>(processor: P) -> (WorkerCore<P>, FdSender) {
        let (poller, waker) = Poller::new().unwrap();
        let (sender, receiver) = fd_channel(16, waker);

        let core = WorkerCore::new(0, poller, receiver, test_config(), Arc::new(processor));

        (core, sender)
    }

    fn connect_to<P: RequestProcessor>(core: &mut WorkerCore<P>) -> (usize, StdStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = StdStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let key = core.install(server.into_raw_fd()).unwrap();

        (key, client)
    }

    #[test]
    fn test_install() {
        let (mut core, _sender) = core_with(ScriptProcessor::new(vec![]));

        let (key, _client) = connect_to(&mut core);

        let conn = &core.conns[key].value;
        assert_eq!(conn.flags.contains(ConnFlags::IS_ALIVE), true);
        assert_eq!(conn.flags.contains(ConnFlags::SHOULD_RESUME), true);
        assert_eq!(conn.time_to_die, 5);
        assert_eq!(core.expire.front(), Some(key));
    }

    #[test]
    fn test_interest_protocol() {
        let (mut core, _sender) = core_with(ScriptProcessor::new(vec![
            ProcessStatus::NeedWrite,
            ProcessStatus::NeedWrite,
            ProcessStatus::NeedRead,
        ]));

        let (key, _client) = connect_to(&mut core);

        // the driver wants prompt resumption: flip to write-side interest
        core.resume_if_needed(key);

        let flags = core.conns[key].value.flags;
        assert_eq!(flags.contains(ConnFlags::WRITE_EVENTS), true);
        assert_eq!(flags.contains(ConnFlags::SHOULD_RESUME), true);

        // wanting the same thing again issues no modify and changes nothing
        core.resume_if_needed(key);

        let flags = core.conns[key].value.flags;
        assert_eq!(flags.contains(ConnFlags::WRITE_EVENTS), true);

        // a forced read flips back to read-side interest
        core.resume_if_needed(key);

        let flags = core.conns[key].value.flags;
        assert_eq!(flags.contains(ConnFlags::MUST_READ), true);
        assert_eq!(flags.contains(ConnFlags::WRITE_EVENTS), false);
    }

    #[test]
    fn test_destroy_on_abort() {
        let (mut core, _sender) = core_with(ScriptProcessor::new(vec![ProcessStatus::Failed]));

        let (key, _client) = connect_to(&mut core);

        core.resume_if_needed(key);

        assert_eq!(core.conns.contains(key), false);
        assert_eq!(core.expire.is_empty(), true);
    }

    #[test]
    fn test_sweep_reaps_expired() {
        let (mut core, _sender) = core_with(ScriptProcessor::new(vec![]));

        let (key, _client) = connect_to(&mut core);

        for _ in 0..4 {
            core.sweep();
            assert_eq!(core.conns.contains(key), true);
        }

        core.sweep();
        assert_eq!(core.conns.contains(key), false);

        // draining the queue rewound the clock
        assert_eq!(core.expire.time(), 0);
        assert_eq!(core.expire.poll_timeout(), None);
    }

    #[test]
    fn test_accept_pending_installs_and_resumes() {
        let (mut core, sender) = core_with(ScriptProcessor::new(vec![ProcessStatus::NeedRead]));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = StdStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        sender.try_send(server.into_raw_fd()).unwrap();
        sender.nudge().unwrap();

        core.accept_pending();

        assert_eq!(core.conns.len(), 1);

        let key = core.expire.front().unwrap();
        let conn = &core.conns[key].value;

        // the driver ran once already and is parked waiting for input
        assert_eq!(conn.flags.contains(ConnFlags::MUST_READ), true);
        assert_eq!(conn.time_to_die, 5);
    }

    #[test]
    fn test_worker_echo() {
        let config = test_config();
        let processor = Arc::new(EchoProcessor);
        let barrier = Arc::new(Barrier::new(2));

        let mut worker = Worker::new(0, &config, &processor, &barrier).unwrap();
        barrier.wait();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = StdStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        // data is in flight before the worker ever sees the socket
        client.write_all(b"hello\n").unwrap();

        assert_eq!(worker.add_client(server.into_raw_fd()), true);
        worker.nudge();

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut resp = [0; 6];
        client.read_exact(&mut resp).unwrap();
        assert_eq!(&resp, b"hello\n");

        worker.stop();
        barrier.wait();
        worker.join();
    }

    #[test]
    fn test_worker_pipelined() {
        let config = test_config();
        let processor = Arc::new(EchoProcessor);
        let barrier = Arc::new(Barrier::new(2));

        let mut worker = Worker::new(0, &config, &processor, &barrier).unwrap();
        barrier.wait();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = StdStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        // two requests in one segment; the second is parsed out of the
        // buffer without waiting for more input. let the segment land
        // before the hand-off so the first resume sees both
        client.write_all(b"one\ntwo\n").unwrap();
        thread::sleep(Duration::from_millis(100));

        assert_eq!(worker.add_client(server.into_raw_fd()), true);
        worker.nudge();

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut resp = [0; 8];
        client.read_exact(&mut resp).unwrap();
        assert_eq!(&resp, b"one\ntwo\n");

        worker.stop();
        barrier.wait();
        worker.join();
    }

    #[test]
    fn test_worker_hangup_runs_cleanups() {
        let config = test_config();
        let count = Arc::new(AtomicUsize::new(0));
        let processor = Arc::new(DeferProbe {
            count: Arc::clone(&count),
        });
        let barrier = Arc::new(Barrier::new(2));

        let mut worker = Worker::new(0, &config, &processor, &barrier).unwrap();
        barrier.wait();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = StdStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        assert_eq!(worker.add_client(server.into_raw_fd()), true);
        worker.nudge();

        // wait for the worker to pick the connection up, then hang up
        thread::sleep(Duration::from_millis(200));
        drop(client);

        let mut waited = Duration::from_millis(0);
        while count.load(Ordering::Relaxed) == 0 && waited < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(50));
            waited += Duration::from_millis(50);
        }

        assert_eq!(count.load(Ordering::Relaxed), 1);

        worker.stop();
        barrier.wait();
        worker.join();
    }

    #[test]
    fn test_worker_idle_expiry() {
        let config = Arc::new(Config {
            workers: 1,
            maxconn: 16,
            keep_alive_timeout: 1,
            ..Config::default()
        });
        let processor = Arc::new(SilentProcessor);
        let barrier = Arc::new(Barrier::new(2));

        let mut worker = Worker::new(0, &config, &processor, &barrier).unwrap();
        barrier.wait();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = StdStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        assert_eq!(worker.add_client(server.into_raw_fd()), true);
        worker.nudge();

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // the worker reaps the idle connection and we observe the close
        let mut buf = [0; 1];
        let size = client.read(&mut buf).unwrap();
        assert_eq!(size, 0);

        worker.stop();
        barrier.wait();
        worker.join();
    }
}
