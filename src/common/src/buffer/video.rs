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

use crate::meta::{Meta, MetaMap};

/// Maximum number of planes a video frame descriptor can carry.
pub const MAX_PLANE_NUM: usize = 8;

/// A detected region of interest attached to a video frame.
///
/// Besides the detection fields, each ROI carries its own typed metadata
/// map so downstream stages (classification, tracking) can annotate a
/// region without touching the frame-level metadata.
#[derive(Debug, Clone, Default)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,

    pub label: String,
    pub label_id: i32,
    pub confidence: f64,

    meta: MetaMap,
}

impl Roi {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            ..Default::default()
        }
    }

    pub fn set_meta<T: Meta>(&mut self, value: T) {
        self.meta.set(value);
    }

    pub fn get_meta<T: Meta>(&self) -> Option<&T> {
        self.meta.get::<T>()
    }

    pub fn erase_meta<T: Meta>(&mut self) -> bool {
        self.meta.erase::<T>()
    }

    pub fn contains_meta<T: Meta>(&self) -> bool {
        self.meta.contains::<T>()
    }
}

/// Descriptor of a decoded video frame, with per-plane layout and the ROI
/// list filled in by detection stages.
#[derive(Debug, Clone)]
pub struct VideoFrameDesc {
    pub frame_id: u32,
    pub width: u32,
    pub height: u32,
    pub plane_num: u32,
    pub stride: [u32; MAX_PLANE_NUM],
    pub offset: [u32; MAX_PLANE_NUM],
    /// Set by upstream stages to mark a frame that should be skipped by
    /// inference but still forwarded for display ordering.
    pub drop: bool,
    pub rois: Vec<Roi>,
}

impl VideoFrameDesc {
    pub fn new(frame_id: u32, width: u32, height: u32) -> Self {
        Self {
            frame_id,
            width,
            height,
            plane_num: 3,
            stride: [0; MAX_PLANE_NUM],
            offset: [0; MAX_PLANE_NUM],
            drop: false,
            rois: Vec::new(),
        }
    }
}
