// Copyright 2025 coScene
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

// Chunk storage module
//
// Provides the trait-based chunk writer abstraction the recorder writes
// through, the factory that picks a container from configuration, and the
// on-disk chunk directory used for time-range lookups and retention.

pub mod backend;
pub mod factory;
pub mod filesystem;

pub use backend::{ChunkWriter, ChunkWriterFactory};
pub use factory::WriterFactory;
pub use filesystem::{overlaps, ChunkName, ChunkStore, StorageUsage, StoredChunk};
