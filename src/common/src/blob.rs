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

use std::fmt;
use std::sync::Arc;

use crate::buffer::Buffer;

/// The unit of work transmitted between nodes: an ordered sequence of
/// buffers sharing one stream id, frame id and user context.
///
/// A blob is built by value (construct, push buffers in order) and then
/// published as `Arc<Blob>`; once published it is shared by every in-port
/// it is routed to and must no longer be mutated. Consumers that need a
/// private mutable copy use [`Blob::clone_deep`].
pub struct Blob {
    bufs: Vec<Arc<Buffer>>,
    pub stream_id: u32,
    pub frame_id: u32,
    /// Opaque user cookie. The framework stores and propagates this value
    /// but never interprets it.
    pub context: i32,
}

impl Blob {
    /// An empty blob on stream 0, frame 0.
    pub fn new() -> Self {
        Self::with_ids(0, 0)
    }

    pub fn with_ids(stream_id: u32, frame_id: u32) -> Self {
        Self {
            bufs: Vec::new(),
            stream_id,
            frame_id,
            context: 0,
        }
    }

    /// Append a buffer; order of insertion is preserved.
    pub fn push(&mut self, buf: Buffer) -> &mut Self {
        self.bufs.push(Arc::new(buf));
        self
    }

    /// Append an already-shared buffer.
    pub fn push_shared(&mut self, buf: Arc<Buffer>) -> &mut Self {
        self.bufs.push(buf);
        self
    }

    pub fn get(&self, idx: usize) -> Option<&Arc<Buffer>> {
        self.bufs.get(idx)
    }

    pub fn bufs(&self) -> &[Arc<Buffer>] {
        &self.bufs
    }

    pub fn len(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Seal the blob for publication.
    pub fn share(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Deep-clone: every contained buffer is cloned, not just re-referenced.
    pub fn clone_deep(&self) -> Self {
        Self {
            bufs: self
                .bufs
                .iter()
                .map(|buf| Arc::new(buf.clone_deep()))
                .collect(),
            stream_id: self.stream_id,
            frame_id: self.frame_id,
            context: self.context,
        }
    }
}

impl Default for Blob {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("stream_id", &self.stream_id)
            .field("frame_id", &self.frame_id)
            .field("bufs", &self.bufs.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_preserves_order() {
        let mut blob = Blob::with_ids(2, 17);
        blob.push(Buffer::from_payload(1u32, 4));
        blob.push(Buffer::from_payload(2u32, 4));
        blob.push(Buffer::from_payload(3u32, 4));

        let seen: Vec<u32> = blob
            .bufs()
            .iter()
            .map(|b| *b.payload::<u32>().unwrap())
            .collect();
        assert_eq!(seen, [1, 2, 3]);
        assert_eq!(blob.stream_id, 2);
        assert_eq!(blob.frame_id, 17);
    }

    #[test]
    fn test_deep_clone_duplicates_buffers() {
        let mut blob = Blob::new();
        blob.push(Buffer::from_payload(vec![1u8, 2], 2));
        let shared = blob.share();

        let copy = shared.clone_deep();
        assert_eq!(copy.len(), 1);
        // Distinct allocations, equal contents.
        assert!(!Arc::ptr_eq(&shared.bufs()[0], &copy.bufs()[0]));
        assert_eq!(
            shared.bufs()[0].payload::<Vec<u8>>(),
            copy.bufs()[0].payload::<Vec<u8>>()
        );
    }

    #[test]
    fn test_context_propagates_on_clone() {
        let mut blob = Blob::new();
        blob.context = -55;
        assert_eq!(blob.clone_deep().context, -55);
    }
}
