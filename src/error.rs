/*
 * Copyright (c) 2024 Yunshan Networks
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

use thiserror::Error;

// Failures are surfaced at startup only. Once the pipeline is running the
// hot path drops or backpressures, it never returns errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("incomplete configuration: {0}")]
    ConfigIncomplete(String),
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
