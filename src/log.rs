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

use log::{LevelFilter, Log, Metadata, Record};
use std::thread;
use time::OffsetDateTime;

/// Stdout logger tagging each record with the emitting thread, so output
/// from the worker pool reads per-worker (threads are named `worker-N`).
struct StdoutLogger;

impl Log for StdoutLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let now = OffsetDateTime::now_utc();

        let thread = thread::current();
        let name = thread.name().unwrap_or("?");

        println!(
            "{:02}:{:02}:{:02}.{:03} {:<5} [{}] {}",
            now.hour(),
            now.minute(),
            now.second(),
            now.millisecond(),
            record.level(),
            name,
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: StdoutLogger = StdoutLogger;

/// Install the stdout logger at the given level. Later calls, or an
/// already-installed logger, leave the first installation in place.
pub fn apply(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
