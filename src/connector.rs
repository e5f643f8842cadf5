//! Channel pooling and counter-key binding.
//!
//! The connector keeps at most one live channel per authority node and binds
//! each counter key to the channel its hash key selects. While the selected
//! node is unchanged, repeated acquires return the same channel; when it
//! changes (or the channel died), the key's pending record is removed from
//! the old channel, its reference count drops, and the channel is torn down
//! once no key holds it.

use crate::channel::RemoteCounterChannel;
use crate::clock::Clock;
use crate::config::QuotaConfig;
use crate::error::TransportError;
use crate::resolver::RemoteNode;
use crate::transport::{AuthorityTransport, CounterKey};
use crate::window::QuotaWindow;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct Connector {
    transport: Arc<dyn AuthorityTransport>,
    config: Arc<QuotaConfig>,
    clock: Arc<dyn Clock>,
    channels: DashMap<RemoteNode, Arc<RemoteCounterChannel>>,
    bindings: DashMap<CounterKey, Arc<RemoteCounterChannel>>,
}

impl Connector {
    pub fn new(
        transport: Arc<dyn AuthorityTransport>,
        config: Arc<QuotaConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            transport,
            config,
            clock,
            channels: DashMap::new(),
            bindings: DashMap::new(),
        }
    }

    /// Channel for `window`'s counter key, targeted at `node`.
    ///
    /// Returns the existing binding while `node` is unchanged and the
    /// channel is alive; otherwise releases the old binding and opens (or
    /// reuses) a channel to `node`. Connection setup happens here, on the
    /// background sync task, never on an application thread.
    pub async fn acquire(
        &self,
        window: &Arc<QuotaWindow>,
        node: RemoteNode,
    ) -> Result<Arc<RemoteCounterChannel>, TransportError> {
        let key = window.key().clone();
        if let Some(bound) = self.bindings.get(&key).map(|b| b.clone()) {
            if bound.node() == &node && !bound.is_terminated() {
                return Ok(bound);
            }
            self.unbind(&key, &bound);
        }

        let channel = self.channel_for(node).await?;
        channel.acquire_ref();
        channel.register(window);
        self.bindings.insert(key, Arc::clone(&channel));
        Ok(channel)
    }

    /// Release a counter key's binding (window deleted or swept).
    pub fn release(&self, key: &CounterKey) {
        if let Some((_, channel)) = self.bindings.remove(key) {
            self.unbind_removed(key, &channel);
        }
    }

    /// Number of live (non-terminated) pooled channels.
    pub fn channel_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|e| !e.value().is_terminated())
            .count()
    }

    /// Tear down every channel and binding (engine shutdown).
    pub fn shutdown(&self) {
        self.bindings.clear();
        for entry in self.channels.iter() {
            entry.value().shutdown();
        }
        self.channels.clear();
    }

    fn unbind(&self, key: &CounterKey, channel: &Arc<RemoteCounterChannel>) {
        self.bindings.remove(key);
        self.unbind_removed(key, channel);
    }

    fn unbind_removed(&self, key: &CounterKey, channel: &Arc<RemoteCounterChannel>) {
        channel.remove_record(key);
        if channel.release_ref() == 0 {
            debug!(
                target: "tollgate::connector",
                node = %channel.node(),
                "last counter released, closing channel"
            );
            channel.shutdown();
            self.channels
                .remove_if(channel.node(), |_, pooled| Arc::ptr_eq(pooled, channel));
        }
    }

    async fn channel_for(
        &self,
        node: RemoteNode,
    ) -> Result<Arc<RemoteCounterChannel>, TransportError> {
        if let Some(existing) = self.channels.get(&node).map(|c| c.clone()) {
            if !existing.is_terminated() {
                return Ok(existing);
            }
            // Dead pool entry; drop it and reconnect lazily.
            self.channels
                .remove_if(&node, |_, pooled| Arc::ptr_eq(pooled, &existing));
        }
        let opened = RemoteCounterChannel::open(
            node.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.config),
            Arc::clone(&self.clock),
        )
        .await?;
        // First writer wins; a concurrent opener's channel is discarded.
        let pooled = match self.channels.entry(node) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().is_terminated() {
                    entry.insert(Arc::clone(&opened));
                    opened
                } else {
                    opened.shutdown();
                    entry.get().clone()
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&opened));
                opened
            }
        };
        Ok(pooled)
    }
}
