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

use arrayvec::ArrayString;
use std::io;
use std::str;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

/// Worker-local cache of the formatted "Date" and "Expires" header values.
/// Each worker owns one, so reads need no locking; values are reformatted
/// at most once per second.
pub struct DateCache {
    last: i64,
    date: ArrayString<32>,
    expires: ArrayString<32>,
}

impl DateCache {
    pub fn new() -> Self {
        Self {
            last: -1,
            date: ArrayString::new(),
            expires: ArrayString::new(),
        }
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn expires(&self) -> &str {
        &self.expires
    }

    pub fn update(&mut self, expires_offset: u64) {
        self.update_at(OffsetDateTime::now_utc(), expires_offset);
    }

    fn update_at(&mut self, now: OffsetDateTime, expires_offset: u64) {
        let secs = now.unix_timestamp();

        if secs == self.last {
            return;
        }

        self.last = secs;

        self.date = format_http_date(now);
        self.expires = format_http_date(now + Duration::seconds(expires_offset as i64));
    }
}

impl Default for DateCache {
    fn default() -> Self {
        Self::new()
    }
}

fn format_http_date(t: OffsetDateTime) -> ArrayString<32> {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );

    let mut buf = [0u8; 64];

    let size = {
        let mut buf = io::Cursor::new(&mut buf[..]);

        t.format_into(&mut buf, &format)
            .expect("failed to write timestamp");

        buf.position() as usize
    };

    let s = str::from_utf8(&buf[..size]).expect("timestamp is not utf-8");

    ArrayString::from(s).unwrap()
}
