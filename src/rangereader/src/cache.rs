// Copyright 2025 Tileverse
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Caching decorators.
//!
//! [MemoryCachingRangeReader][memory::MemoryCachingRangeReader] keeps slices
//! in RAM; [DiskCachingRangeReader][disk::DiskCachingRangeReader] persists
//! them as files. The two compose: memory over disk over a backend gives a
//! small hot set in RAM backed by a large warm set on disk.

pub mod disk;
pub mod memory;
