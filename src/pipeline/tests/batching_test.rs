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

//! Stream batching behavior through a full pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fusionflow_pipeline::batching::BatchingConfig;
use fusionflow_pipeline::event::EVENT_PIPELINE_STOP;
use fusionflow_pipeline::node::Node;
use fusionflow_pipeline::pipeline::Pipeline;
use fusionflow_pipeline::test_utils::{CollectorNode, EmitterNode, Observation};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Four streams sharded over two batch indices: each worker only ever
/// observes its own residue class, and frame ids within every stream
/// arrive strictly increasing.
#[test]
fn test_stream_sharding_and_order() {
    let emitter = Arc::new(EmitterNode::new(1, 40).with_streams(4));
    let sink = Arc::new(CollectorNode::new(1));
    let observations = sink.observations();
    sink.core().config_batch(BatchingConfig::with_stream(2, 4));
    // Stream batching scans past blocked streams; give the queue room.
    sink.core().in_port(0).unwrap().set_queue_capacity(16);

    let mut pipeline = Pipeline::new();
    pipeline.set_source(emitter, "emit").unwrap();
    pipeline.add_node(Arc::clone(&sink) as Arc<dyn Node>, "collect").unwrap();
    pipeline.link_node("emit", 0, "collect", 0).unwrap();
    pipeline.prepare().unwrap();
    pipeline.start().unwrap();
    pipeline
        .wait_for_event_timeout(EVENT_PIPELINE_STOP, STOP_TIMEOUT)
        .unwrap();

    let seen: Vec<Observation> = observations.lock().clone();
    assert_eq!(seen.len(), 40, "every blob reaches exactly one worker");

    // Sharding: batch index b observes only streams with stream % 2 == b.
    for obs in &seen {
        assert_eq!(
            obs.stream_id as usize % 2,
            obs.batch_idx,
            "stream {} observed by batch {}",
            obs.stream_id,
            obs.batch_idx
        );
    }

    // Strict per-stream frame succession.
    let mut last_frame: HashMap<u32, u32> = HashMap::new();
    for obs in &seen {
        if let Some(last) = last_frame.get(&obs.stream_id) {
            assert!(
                obs.frame_id > *last,
                "stream {} regressed from {} to {}",
                obs.stream_id,
                last,
                obs.frame_id
            );
        }
        last_frame.insert(obs.stream_id, obs.frame_id);
    }
    assert_eq!(last_frame.len(), 4, "all four streams were served");
}

/// Unordered stream batching still shards correctly but tolerates frame
/// gaps, so every blob is delivered even without succession.
#[test]
fn test_unordered_stream_batching_delivers_all() {
    let emitter = Arc::new(EmitterNode::new(1, 30).with_streams(3));
    let sink = Arc::new(CollectorNode::new(1));
    let observations = sink.observations();
    let mut config = BatchingConfig::with_stream(3, 3);
    config.policy = fusionflow_pipeline::batching::BatchingPolicy::WithStreamIgnoreOrder;
    sink.core().config_batch(config);
    sink.core().in_port(0).unwrap().set_queue_capacity(16);

    let mut pipeline = Pipeline::new();
    pipeline.set_source(emitter, "emit").unwrap();
    pipeline.add_node(Arc::clone(&sink) as Arc<dyn Node>, "collect").unwrap();
    pipeline.link_node("emit", 0, "collect", 0).unwrap();
    pipeline.prepare().unwrap();
    pipeline.start().unwrap();
    pipeline
        .wait_for_event_timeout(EVENT_PIPELINE_STOP, STOP_TIMEOUT)
        .unwrap();

    let seen = observations.lock().clone();
    assert_eq!(seen.len(), 30);
    for obs in &seen {
        assert_eq!(obs.stream_id as usize % 3, obs.batch_idx);
    }
}
