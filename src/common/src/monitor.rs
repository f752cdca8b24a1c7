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

use std::sync::LazyLock;

use prometheus::Registry;

/// The process-wide metrics registry every pipeline registers its
/// collectors against. Exposed so embedders can gather and export it
/// alongside their own metrics.
pub static GLOBAL_METRICS_REGISTRY: LazyLock<Registry> =
    LazyLock::new(|| Registry::new_custom(Some("fusionflow".to_owned()), None).unwrap());
