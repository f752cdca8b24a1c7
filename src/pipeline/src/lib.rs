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

//! The FusionFlow graph runtime.
//!
//! A pipeline is a directed graph of [`Node`](node::Node)s whose out-ports
//! feed bounded in-port queues on downstream nodes. Each node spawns one or
//! more [`NodeWorker`](node::NodeWorker)s; workers are grouped into
//! [`Executor`](executor::Executor)s, each driving its workers sequentially
//! on a dedicated OS thread. A synchronous [`EventManager`](event::EventManager)
//! carries EOS and monitoring signals across the graph, and the
//! [`Pipeline`](pipeline::Pipeline) coordinates the shared lifecycle:
//! configure, prepare, start, deplete, stop and rearm.
//!
//! ```no_run
//! use std::sync::Arc;
//! use fusionflow_pipeline::pipeline::Pipeline;
//! use fusionflow_pipeline::event::EVENT_PIPELINE_STOP;
//! use fusionflow_pipeline::test_utils::{CollectorNode, EmitterNode};
//!
//! let mut pl = Pipeline::new();
//! let emitter = Arc::new(EmitterNode::new(1, 10));
//! let sink = Arc::new(CollectorNode::new(1));
//! pl.set_source(emitter, "emit").unwrap();
//! pl.add_node(sink.clone(), "collect").unwrap();
//! pl.link_node("emit", 0, "collect", 0).unwrap();
//! pl.prepare().unwrap();
//! pl.start().unwrap();
//! pl.wait_for_event(EVENT_PIPELINE_STOP).unwrap();
//! ```

pub mod batching;
pub mod event;
pub mod executor;
pub mod monitor;
pub mod node;
pub mod parser;
pub mod pipeline;
pub mod port;
pub mod registry;
pub mod test_utils;

pub use fusionflow_common::{FlowError, FlowResult, State};
