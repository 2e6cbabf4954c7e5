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

pub mod config;
pub mod conn;
pub mod coro;
pub mod datecache;
pub mod expire;
pub mod list;
pub mod log;
pub mod poller;
pub mod request;
pub mod server;
pub mod spsc;
pub mod worker;
