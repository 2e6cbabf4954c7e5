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

use crate::list;
use slab::Slab;
use std::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_millis(1000);

pub trait Expires {
    fn time_to_die(&self) -> u64;
    fn set_time_to_die(&mut self, t: u64);

    /// Whether a refresh extends the entry's life by the full keep-alive
    /// window, or schedules it for immediate reaping.
    fn refreshable(&self) -> bool;
}

/// Idle-expiry queue over a worker's connection slab.
///
/// Entries are linked through their slab nodes and kept ordered by
/// `time_to_die`: insertion and refresh both append at the tail with the
/// current tick plus a constant window, so the head is always the next
/// entry to expire. Time is a per-worker logical clock advanced once per
/// quiescent poll interval and reset to zero whenever the queue drains,
/// which keeps the tick counter bounded.
pub struct ExpireQueue {
    l: list::List,
    time: u64,
    keep_alive_timeout: u64,
}

impl ExpireQueue {
    pub fn new(keep_alive_timeout: u64) -> Self {
        Self {
            l: list::List::default(),
            time: 0,
            keep_alive_timeout,
        }
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn is_empty(&self) -> bool {
        self.l.is_empty()
    }

    pub fn front(&self) -> Option<usize> {
        self.l.front()
    }

    /// How long the event loop may sleep: one sweep interval while any
    /// connection awaits expiry, forever otherwise.
    pub fn poll_timeout(&self) -> Option<Duration> {
        if self.l.is_empty() {
            None
        } else {
            Some(SWEEP_INTERVAL)
        }
    }

    pub fn insert<T>(&mut self, entries: &mut Slab<list::Node<T>>, key: usize)
    where
        T: Expires,
    {
        entries[key]
            .value
            .set_time_to_die(self.time + self.keep_alive_timeout);

        self.l.push_back(entries, key);
    }

    pub fn remove<T>(&mut self, entries: &mut Slab<list::Node<T>>, key: usize) {
        self.l.remove(entries, key);
    }

    /// Move an entry to the tail after activity on it. A refreshable entry
    /// gets a fresh keep-alive window; anything else is marked to be
    /// reaped on the next sweep.
    pub fn refresh<T>(&mut self, entries: &mut Slab<list::Node<T>>, key: usize)
    where
        T: Expires,
    {
        let t = if entries[key].value.refreshable() {
            self.time + self.keep_alive_timeout
        } else {
            self.time
        };

        entries[key].value.set_time_to_die(t);

        self.l.remove(entries, key);
        self.l.push_back(entries, key);
    }

    pub fn tick(&mut self) {
        self.time += 1;
    }

    /// The head entry, if it is due at the current time. Callers destroy
    /// it (which removes it) and ask again.
    pub fn next_expired<T>(&self, entries: &Slab<list::Node<T>>) -> Option<usize>
    where
        T: Expires,
    {
        let key = self.l.front()?;

        if entries[key].value.time_to_die() <= self.time {
            Some(key)
        } else {
            None
        }
    }

    /// Rewind the clock once nothing remains scheduled. Safe because every
    /// entry's deadline is relative to the tick at which it was refreshed.
    pub fn settle(&mut self) {
        if self.l.is_empty() {
            self.time = 0;
        }
    }
}
