// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-local channel registry.
//!
//! An event loop typically touches many channels and creates several roles
//! per channel (a reader and a watcher, say). Mapping a region is not free
//! and the `Channel` must outlive every role, so processes keep one shared
//! map from channel name to mapping and hand out `Arc`s. Setup-path only;
//! nothing here is realtime safe.

use crate::channel::Channel;
use crate::layout::QueueConfig;
use crate::Result;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Shared map of attached channels, keyed by segment name.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to `name`, reusing an existing mapping when one is held.
    /// Two callers racing on a new name both attach; the loser's mapping is
    /// dropped (attaching is idempotent, so this is only wasted work).
    pub fn open_or_create(&self, name: &str, config: QueueConfig) -> Result<Arc<Channel>> {
        if let Some(channel) = self
            .channels
            .read()
            .expect("registry lock poisoned")
            .get(name)
        {
            return Ok(Arc::clone(channel));
        }

        let channel = Arc::new(Channel::open_or_create(name, config)?);
        let mut channels = self.channels.write().expect("registry lock poisoned");
        let entry = channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&channel));
        Ok(Arc::clone(entry))
    }

    /// Look up an already attached channel.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Drop this process's mapping of `name`. Roles still holding the `Arc`
    /// keep it alive; the region itself is untouched.
    pub fn detach(&self, name: &str) -> bool {
        self.channels
            .write()
            .expect("registry lock poisoned")
            .remove(name)
            .is_some()
    }

    /// Names of every attached channel, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
