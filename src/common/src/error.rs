// Copyright 2025 FusionFlow Contributors
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

use crate::state::State;

/// A specialized Result type for framework operations.
pub type FlowResult<T> = std::result::Result<T, FlowError>;

/// The error type shared by every framework operation.
///
/// `Timeout` and `EndOfStream` are flow-control outcomes rather than faults:
/// a blocking port call reports `Timeout` when its deadline elapses and
/// `EndOfStream` when the port transitions to stop while the caller waits.
/// Callers are expected to match on them and continue.
#[derive(thiserror::Error, Debug)]
pub enum FlowError {
    #[error("operation failed: {0}")]
    Failure(Box<str>),

    #[error("blocking call timed out")]
    Timeout,

    #[error("port or queue reached end of stream")]
    EndOfStream,

    #[error("invalid in state {current}, requires {required}")]
    NotReady { current: State, required: State },

    #[error("state transition {from} -> {to} is not allowed")]
    InvalidTransition { from: State, to: State },

    #[error("no common protocol between out-port {from} and in-port {to}")]
    ProtocolMismatch { from: Box<str>, to: Box<str> },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(Box<str>),

    #[error("duplicated node name: {0}")]
    DuplicateName(Box<str>),

    #[error("no such node: {0}")]
    UnknownNode(Box<str>),

    #[error("pipeline graph contains a cycle")]
    CycleDetected,

    #[error("event {0:#x} is not registered")]
    UnregisteredEvent(u64),

    #[error("node class is not registered: {0}")]
    UnknownClass(Box<str>),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

static_assertions::const_assert!(std::mem::size_of::<FlowError>() <= 40);

impl FlowError {
    /// Shorthand for the generic non-recoverable failure kind.
    pub fn failure(msg: impl Into<String>) -> Self {
        Self::Failure(msg.into().into_boxed_str())
    }

    /// Whether the error is a flow-control outcome (timeout / end-of-stream)
    /// rather than a fault.
    pub fn is_flow_control(&self) -> bool {
        matches!(self, Self::Timeout | Self::EndOfStream)
    }
}
