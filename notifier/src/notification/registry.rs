//! Provider registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::channels::{ChannelProvider, normalize_channel};
use crate::{Error, Result};

/// Channel name -> provider table, filled at startup and read on every dispatch.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn ChannelProvider>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its channel name. A later registration for the
    /// same channel replaces the earlier one.
    pub fn register(&self, provider: Arc<dyn ChannelProvider>) {
        let channel = normalize_channel(provider.channel());
        let replaced = self
            .providers
            .write()
            .insert(channel.clone(), provider)
            .is_some();
        info!(channel = %channel, replaced, "Registered channel provider");
    }

    pub fn unregister(&self, channel: &str) -> Option<Arc<dyn ChannelProvider>> {
        self.providers.write().remove(&normalize_channel(channel))
    }

    /// Resolve a channel name to its provider.
    pub fn resolve(&self, channel: &str) -> Result<Arc<dyn ChannelProvider>> {
        let channel = normalize_channel(channel);
        self.providers
            .read()
            .get(&channel)
            .cloned()
            .ok_or(Error::UnsupportedChannel(channel))
    }

    pub fn is_supported(&self, channel: &str) -> bool {
        self.providers
            .read()
            .contains_key(&normalize_channel(channel))
    }

    /// Registered channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.providers.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Flip a provider's kill-switch.
    pub fn set_enabled(&self, channel: &str, enabled: bool) -> Result<()> {
        let provider = self.resolve(channel)?;
        provider.set_enabled(enabled);
        info!(channel = %provider.channel(), enabled, "Channel kill-switch changed");
        Ok(())
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("channels", &self.channels())
            .finish()
    }
}
