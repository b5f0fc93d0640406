// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("channel recv error: {0}")]
    ChannelRecvError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    TracingError(String),

    /// engine lifecycle misuse
    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    /// node level errors
    #[error("node closed: {0}")]
    NodeClosed(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// wire protocol errors
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame too large: {0}")]
    FrameTooLarge(String),

    /// marker error
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Protocol corruption leaves the stream desynchronised but the node alive.
    pub fn is_corruption(&self) -> bool {
        matches!(self, AppError::MalformedFrame(_) | AppError::FrameTooLarge(_))
    }
}
