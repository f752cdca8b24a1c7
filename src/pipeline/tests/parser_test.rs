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

//! Topology parsing plus the class registration entry points, end to end.

use std::sync::Arc;
use std::time::Duration;

use fusionflow_pipeline::event::EVENT_PIPELINE_STOP;
use fusionflow_pipeline::node::Node;
use fusionflow_pipeline::parser::PipelineParser;
use fusionflow_pipeline::registry::{node_from_raw, NodeRegistry};
use fusionflow_pipeline::test_utils::{CollectorNode, EmitterNode};
use fusionflow_pipeline::{enable_dynamic_loading, export_plugin, FlowResult, State};

// The same declarations a node library would carry: per-class C entry
// points plus the library-wide registration hook.
enable_dynamic_loading!(EmitterNode, |threads: usize| -> FlowResult<
    Arc<dyn Node>,
> {
    Ok(Arc::new(EmitterNode::with_threads(1, 12, threads)))
});
enable_dynamic_loading!(CollectorNode, |_threads: usize| -> FlowResult<
    Arc<dyn Node>,
> { Ok(Arc::new(CollectorNode::new(1))) });
export_plugin!(EmitterNode, CollectorNode);

fn register_classes() {
    // In-process equivalent of the loader invoking the plugin entry point.
    fusionflow_plugin_register(NodeRegistry::global());
}

#[test]
fn test_create_entry_point_round_trip() {
    let raw = EmitterNode_create(3);
    let node = unsafe { node_from_raw(raw) }.expect("create returns a node");
    assert_eq!(node.class_name(), "EmitterNode");
    assert_eq!(node.core().thread_num(), 3);
}

#[test]
fn test_parsed_pipeline_runs_to_completion() {
    register_classes();
    let doc = r#"{
        "nodes": [
            { "name": "src", "class": "EmitterNode", "threads": 1, "config": "Rate=30" },
            { "name": "sink", "class": "CollectorNode" }
        ],
        "edges": [
            { "from": "src", "outPort": 0, "to": "sink", "inPort": 0 }
        ]
    }"#;

    let mut pipeline = PipelineParser::new().parse_from_string(doc).unwrap();
    pipeline.prepare().unwrap();
    pipeline.start().unwrap();
    pipeline
        .wait_for_event_timeout(EVENT_PIPELINE_STOP, Duration::from_secs(10))
        .unwrap();
    assert_eq!(pipeline.state(), State::Stop);
}

#[test]
fn test_edge_to_unknown_node_fails() {
    register_classes();
    let doc = r#"{
        "nodes": [ { "name": "src", "class": "EmitterNode" } ],
        "edges": [ { "from": "src", "outPort": 0, "to": "ghost", "inPort": 0 } ]
    }"#;
    assert!(PipelineParser::new().parse_from_string(doc).is_err());
}
