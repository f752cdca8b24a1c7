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

//! The buffer data model.
//!
//! A [`Buffer`] wraps an opaque payload of any `'static` type together with
//! a release action, a reported size, a user tag, a per-family key-string
//! and a typed metadata map. Concrete buffer families (video frames, radar
//! cubes) attach a descriptor through [`BufferKind`]; everything else rides
//! the `Raw` variant, identified only by its key-string.
//!
//! Buffers are immutable once published to a port: producers fill them in,
//! wrap them into a blob and hand them off; consumers that need to mutate
//! must [`Buffer::clone_deep`] first.

mod radar;
mod video;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

pub use self::radar::RadarDesc;
pub use self::video::{Roi, VideoFrameDesc, MAX_PLANE_NUM};
use crate::meta::{Meta, MetaMap};

/// Key-string of the plain user buffer family.
pub const KEY_RAW: &str = "raw";
/// Key-string of the video frame buffer family.
pub const KEY_VIDEO_FRAME: &str = "video_frame";
/// Key-string of the radar cube buffer family.
pub const KEY_RADAR_CUBE: &str = "radar_cube";

/// Hands out the per-process unique integer associated with a key-string.
///
/// The integer is stable for the lifetime of the process only; different
/// runs or hosts may assign different numbers to the same key-string.
pub fn uid_of(key: &str) -> u32 {
    static UIDS: LazyLock<Mutex<HashMap<String, u32>>> =
        LazyLock::new(|| Mutex::new(HashMap::new()));
    let mut uids = UIDS.lock();
    let next = uids.len() as u32;
    *uids.entry(key.to_owned()).or_insert(next)
}

/// Descriptor variant attached to a buffer, one per known buffer family.
#[derive(Debug, Clone, Default)]
pub enum BufferKind {
    /// Opaque user buffer; the payload type is known only to its producer.
    #[default]
    Raw,
    VideoFrame(VideoFrameDesc),
    Radar(RadarDesc),
}

impl BufferKind {
    pub fn key_string(&self) -> &'static str {
        match self {
            BufferKind::Raw => KEY_RAW,
            BufferKind::VideoFrame(_) => KEY_VIDEO_FRAME,
            BufferKind::Radar(_) => KEY_RADAR_CUBE,
        }
    }
}

/// Release action invoked exactly once when the payload it belongs to is
/// dropped or replaced.
type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;
/// Deep-clone closure captured at construction, since the payload type is
/// erased afterwards. Shared so that clones keep the ability to clone.
type CloneFn = Arc<dyn Fn(&(dyn Any + Send + Sync)) -> Box<dyn Any + Send + Sync> + Send + Sync>;

struct Payload {
    value: Box<dyn Any + Send + Sync>,
    clone_fn: CloneFn,
    release: Option<ReleaseFn>,
}

impl Payload {
    fn new<T: Any + Clone + Send + Sync>(value: T, release: Option<ReleaseFn>) -> Self {
        Self {
            value: Box::new(value),
            clone_fn: Arc::new(|any| {
                let value = any
                    .downcast_ref::<T>()
                    .expect("payload type fixed at construction");
                Box::new(value.clone())
            }),
            release,
        }
    }

    fn clone_value(&self) -> Self {
        Self {
            value: (self.clone_fn)(self.value.as_ref()),
            clone_fn: Arc::clone(&self.clone_fn),
            release: None,
        }
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// The unit payload container flowing through the graph inside blobs.
pub struct Buffer {
    payload: Payload,
    kind: BufferKind,
    size: usize,
    tag: u32,
    meta: MetaMap,
}

impl Buffer {
    /// Wrap `value` into a raw buffer with a reported size.
    pub fn from_payload<T: Any + Clone + Send + Sync>(value: T, size: usize) -> Self {
        Self {
            payload: Payload::new(value, None),
            kind: BufferKind::Raw,
            size,
            tag: 0,
            meta: MetaMap::new(),
        }
    }

    /// Wrap `value` with a release action fired exactly once when the buffer
    /// drops or the payload is replaced via [`Buffer::set`].
    pub fn with_release<T: Any + Clone + Send + Sync>(
        value: T,
        size: usize,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            payload: Payload::new(value, Some(Box::new(release))),
            kind: BufferKind::Raw,
            size,
            tag: 0,
            meta: MetaMap::new(),
        }
    }

    /// Attach a family descriptor, turning a raw buffer into e.g. a video
    /// frame buffer.
    pub fn with_kind(mut self, kind: BufferKind) -> Self {
        self.kind = kind;
        self
    }

    /// Borrow the payload as `T`. Returns `None` when `T` does not match
    /// the type fixed at construction.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.value.downcast_ref::<T>()
    }

    /// Replace the payload, invoking the previous release action exactly
    /// once. The new payload may be of a different type.
    pub fn set<T: Any + Clone + Send + Sync>(&mut self, value: T) {
        self.payload = Payload::new(value, None);
    }

    /// Replace the payload together with a new release action.
    pub fn set_with_release<T: Any + Clone + Send + Sync>(
        &mut self,
        value: T,
        release: impl FnOnce() + Send + Sync + 'static,
    ) {
        self.payload = Payload::new(value, Some(Box::new(release)));
    }

    pub fn kind(&self) -> &BufferKind {
        &self.kind
    }

    pub fn kind_mut(&mut self) -> &mut BufferKind {
        &mut self.kind
    }

    /// Stable per-family identifier of this buffer.
    pub fn key_string(&self) -> &'static str {
        self.kind.key_string()
    }

    /// Per-process unique integer for this buffer's family.
    pub fn uid(&self) -> u32 {
        uid_of(self.key_string())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn set_size(&mut self, size: usize) {
        self.size = size;
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Tag this buffer with an arbitrary user value.
    pub fn tag_as(&mut self, tag: u32) {
        self.tag = tag;
    }

    /// Attach metadata, replacing any previous value of the same type.
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

    pub fn erase_all_meta(&mut self) {
        self.meta.erase_all();
    }

    /// Deep-clone this buffer: payload, descriptor and metadata map are all
    /// duplicated. The clone carries no release action.
    pub fn clone_deep(&self) -> Self {
        Self {
            payload: self.payload.clone_value(),
            kind: self.kind.clone(),
            size: self.size,
            tag: self.tag,
            meta: self.meta.clone(),
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("key", &self.key_string())
            .field("size", &self.size)
            .field("tag", &self.tag)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}
