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

//! Data model and shared runtime primitives for the FusionFlow pipeline
//! framework: the [`Blob`](blob::Blob)/[`Buffer`](buffer::Buffer) payload
//! containers, the typed metadata map, port protocols, the lifecycle state
//! machine and the common error type.
//!
//! Everything in this crate is independent of the graph runtime; the
//! `fusionflow_pipeline` crate builds the node/port/executor machinery on
//! top of these types.

pub mod blob;
pub mod buffer;
pub mod config;
pub mod error;
pub mod meta;
pub mod monitor;
pub mod protocol;
pub mod state;

pub use error::{FlowError, FlowResult};
pub use state::State;
