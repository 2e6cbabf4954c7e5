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

/// Outcome of resuming a connection driver. Ordered so that anything below
/// `MayResume` means the connection must be torn down.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Yield {
    Abort = -1,
    MayResume = 0,
    WantRead = 1,
    WantWrite = 2,
}

/// Stack of deferred cleanups, run newest-first. The generation marker
/// delimits per-request scopes: cleanups registered at or above a saved
/// generation can be run without disturbing longer-lived ones below it.
pub struct DeferStack {
    cleanups: Vec<Box<dyn FnOnce()>>,
}

impl DeferStack {
    pub fn new() -> Self {
        Self {
            cleanups: Vec::new(),
        }
    }

    pub fn defer<F>(&mut self, f: F)
    where
        F: FnOnce() + 'static,
    {
        self.cleanups.push(Box::new(f));
    }

    pub fn generation(&self) -> usize {
        self.cleanups.len()
    }

    /// Run every cleanup registered at or above `generation`, newest first.
    pub fn run(&mut self, generation: usize) {
        while self.cleanups.len() > generation {
            let f = self.cleanups.pop().unwrap();
            f();
        }
    }

    pub fn run_all(&mut self) {
        self.run(0);
    }
}

impl Default for DeferStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeferStack {
    fn drop(&mut self) {
        self.run_all();
    }
}
