//! Process-wide directory of stream actors, keyed by logical stream name.
//!
//! Actors are created lazily the first time a name is located and then live
//! for the rest of the process, idling whenever they have no subscribers.

use crate::config::CacheConfig;
use crate::error::StreamError;
use crate::stream::{StreamHandle, Upstream};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

const REGISTRY_QUEUE: usize = 64;

enum RegistryRequest {
    Locate {
        name: String,
        reply: oneshot::Sender<StreamHandle>,
    },
    Names {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Cloneable handle to the registry loop.
#[derive(Clone)]
pub struct StreamRegistry {
    requests: mpsc::Sender<RegistryRequest>,
}

impl StreamRegistry {
    /// Starts the registry. Every actor it creates connects through `upstream`.
    pub fn spawn(upstream: Arc<dyn Upstream>, cache: CacheConfig) -> Self {
        let (requests, mut inbox) = mpsc::channel(REGISTRY_QUEUE);
        tokio::spawn(async move {
            let mut streams: HashMap<String, StreamHandle> = HashMap::new();
            while let Some(request) = inbox.recv().await {
                match request {
                    RegistryRequest::Locate { name, reply } => {
                        let handle = streams
                            .entry(name)
                            .or_insert_with_key(|name| {
                                info!(stream = %name, "creating stream actor");
                                StreamHandle::spawn(name, Arc::clone(&upstream), &cache)
                            })
                            .clone();
                        let _ = reply.send(handle);
                    }
                    RegistryRequest::Names { reply } => {
                        let mut names: Vec<String> = streams.keys().cloned().collect();
                        names.sort();
                        let _ = reply.send(names);
                    }
                }
            }
        });
        Self { requests }
    }

    /// Returns the actor for `name`, creating it if this is the first request.
    pub async fn locate(&self, name: &str) -> Result<StreamHandle, StreamError> {
        let (reply, handle) = oneshot::channel();
        self.requests
            .send(RegistryRequest::Locate {
                name: name.to_string(),
                reply,
            })
            .await
            .map_err(|_| StreamError::RegistryGone)?;
        handle.await.map_err(|_| StreamError::RegistryGone)
    }

    /// Names of all streams created so far, sorted.
    pub async fn names(&self) -> Result<Vec<String>, StreamError> {
        let (reply, names) = oneshot::channel();
        self.requests
            .send(RegistryRequest::Names { reply })
            .await
            .map_err(|_| StreamError::RegistryGone)?;
        names.await.map_err(|_| StreamError::RegistryGone)
    }
}
