// Copyright 2025 Livemem (https://github.com/livemem)
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

//! Process-local named locks.
//!
//! One server process owns all domain state, so plain async mutexes are
//! sufficient; store-based locking was rejected (fragile under crashes,
//! poor conditional-write support on the target vendor).
//!
//! Two kinds of locks:
//! - one consolidation mutex per space, created lazily. A second caller
//!   does not queue: it gets `None` and reports `conflict`;
//! - one global mutex for the token registry's read-modify-write cycle.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct LockRegistry {
    consolidation: DashMap<String, Arc<Mutex<()>>>,
    tokens: Arc<Mutex<()>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn consolidation_lock(&self, space_id: &str) -> Arc<Mutex<()>> {
        self.consolidation
            .entry(space_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Try to start a consolidation for a space. `None` means one is
    /// already running; the caller must fail fast with `conflict`.
    /// The guard is held across every suspension point of the pipeline.
    pub fn try_consolidation(&self, space_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.consolidation_lock(space_id).try_lock_owned().ok()
    }

    /// The global token-registry mutex.
    pub fn tokens(&self) -> Arc<Mutex<()>> {
        self.tokens.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_caller_fails_fast() {
        let locks = LockRegistry::new();
        let guard = locks.try_consolidation("demo");
        assert!(guard.is_some());
        assert!(locks.try_consolidation("demo").is_none());
        drop(guard);
        assert!(locks.try_consolidation("demo").is_some());
    }

    #[tokio::test]
    async fn spaces_lock_independently() {
        let locks = LockRegistry::new();
        let _a = locks.try_consolidation("alpha").unwrap();
        assert!(locks.try_consolidation("beta").is_some());
    }

    #[tokio::test]
    async fn tokens_mutex_is_shared() {
        let locks = LockRegistry::new();
        let handle = locks.tokens();
        let guard = handle.lock().await;
        assert!(locks.tokens().try_lock().is_err());
        drop(guard);
        assert!(locks.tokens().try_lock().is_ok());
    }
}
