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

//! JSON topology parser.
//!
//! Builds a ready-to-prepare [`Pipeline`] from a document of the form
//!
//! ```json
//! { "nodes": [ { "name": "src", "class": "EmitterNode", "threads": 1, "config": "Total=10" } ],
//!   "edges": [ { "from": "src", "outPort": 0, "to": "sink", "inPort": 0 } ] }
//! ```
//!
//! Classes resolve through a [`NodeRegistry`]; nodes with no incoming edge
//! are registered as sources.

use std::path::Path;

use fusionflow_common::error::{FlowError, FlowResult};
use serde::Deserialize;

use crate::pipeline::Pipeline;
use crate::registry::NodeRegistry;

fn default_threads() -> usize {
    1
}

#[derive(Debug, Deserialize)]
struct NodeDoc {
    name: String,
    class: String,
    #[serde(default = "default_threads")]
    threads: usize,
    #[serde(default)]
    config: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EdgeDoc {
    from: String,
    out_port: usize,
    to: String,
    in_port: usize,
}

#[derive(Debug, Deserialize)]
struct PipelineDoc {
    nodes: Vec<NodeDoc>,
    edges: Vec<EdgeDoc>,
}

/// Parser turning a JSON pipeline description into a [`Pipeline`].
#[derive(Default)]
pub struct PipelineParser;

impl PipelineParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse the file at `path`, resolving classes via the global registry.
    pub fn parse(&self, path: impl AsRef<Path>) -> FlowResult<Pipeline> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FlowError::failure(format!("cannot read {}: {e}", path.display())))?;
        self.parse_from_string(&contents)
    }

    /// Parse a JSON string, resolving classes via the global registry.
    pub fn parse_from_string(&self, json: &str) -> FlowResult<Pipeline> {
        self.parse_with(json, NodeRegistry::global())
    }

    /// Parse a JSON string against an explicit registry.
    pub fn parse_with(&self, json: &str, registry: &NodeRegistry) -> FlowResult<Pipeline> {
        let doc: PipelineDoc = serde_json::from_str(json).map_err(|e| {
            FlowError::InvalidConfiguration(
                format!("malformed pipeline description: {e}").into_boxed_str(),
            )
        })?;

        let mut pipeline = Pipeline::new();
        for node_doc in &doc.nodes {
            let node = registry.instantiate(&node_doc.class, node_doc.threads)?;
            let has_upstream = doc.edges.iter().any(|edge| edge.to == node_doc.name);
            if has_upstream {
                pipeline.add_node(node, &node_doc.name)?;
            } else {
                pipeline.set_source(node, &node_doc.name)?;
            }
            if !node_doc.config.is_empty() {
                pipeline
                    .node(&node_doc.name)?
                    .configure_by_string(&node_doc.config)?;
            }
        }
        for edge in &doc.edges {
            pipeline.link_node(&edge.from, edge.out_port, &edge.to, edge.in_port)?;
        }
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::node::Node;
    use crate::test_utils::{CollectorNode, EmitterNode};

    const DOC: &str = r#"{
        "nodes": [
            { "name": "src", "class": "EmitterNode", "threads": 1, "config": "Total=10" },
            { "name": "sink", "class": "CollectorNode" }
        ],
        "edges": [
            { "from": "src", "outPort": 0, "to": "sink", "inPort": 0 }
        ]
    }"#;

    #[test]
    fn test_parse_builds_topology() {
        let registry = NodeRegistry::global();
        registry.register_ctor("EmitterNode", |threads| {
            Ok(Arc::new(EmitterNode::with_threads(1, 10, threads)) as Arc<dyn Node>)
        });
        registry.register_ctor("CollectorNode", |_| {
            Ok(Arc::new(CollectorNode::new(1)) as Arc<dyn Node>)
        });

        let pipeline = PipelineParser::new().parse_from_string(DOC).unwrap();
        assert!(pipeline.node("src").is_ok());
        assert!(pipeline.node("sink").is_ok());
        assert_eq!(
            pipeline.node("src").unwrap().core().config_string(),
            "Total=10"
        );
    }

    #[test]
    fn test_unknown_class_surfaces() {
        let doc = r#"{ "nodes": [ { "name": "x", "class": "Mystery" } ], "edges": [] }"#;
        let err = PipelineParser::new().parse_from_string(doc).unwrap_err();
        assert!(matches!(err, FlowError::UnknownClass(_)));
    }

    #[test]
    fn test_malformed_json_is_invalid_configuration() {
        let err = PipelineParser::new().parse_from_string("{").unwrap_err();
        assert!(matches!(err, FlowError::InvalidConfiguration(_)));
    }
}
