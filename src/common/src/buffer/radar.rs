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

use num_complex::Complex32;

/// Descriptor of one radar frame: a 3-D cube of complex ADC samples laid
/// out as `chirps x samples x (transmitters x receivers)`.
#[derive(Debug, Clone)]
pub struct RadarDesc {
    pub frame_id: u32,
    /// Receiver antenna count.
    pub receiver_num: u32,
    /// Transmitter antenna count.
    pub transmitter_num: u32,
    /// ADC samples per chirp.
    pub sample_num: u32,
    /// Chirps per frame.
    pub chirp_num: u32,
    pub cube: Vec<Complex32>,
}

impl RadarDesc {
    pub fn new(frame_id: u32, receiver_num: u32, transmitter_num: u32, sample_num: u32, chirp_num: u32) -> Self {
        let len = (receiver_num * transmitter_num * sample_num * chirp_num) as usize;
        Self {
            frame_id,
            receiver_num,
            transmitter_num,
            sample_num,
            chirp_num,
            cube: vec![Complex32::new(0.0, 0.0); len],
        }
    }

    /// Number of complex samples one full cube holds.
    pub fn cube_len(&self) -> usize {
        (self.receiver_num * self.transmitter_num * self.sample_num * self.chirp_num) as usize
    }

    /// Whether the cube vector matches the advertised dimensions.
    pub fn is_complete(&self) -> bool {
        self.cube.len() == self.cube_len()
    }
}
