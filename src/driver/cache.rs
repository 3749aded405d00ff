//! Network-resource cache.
//!
//! One long-lived task owns the map; callers talk to it through the get,
//! put and delete mailboxes. Every resource is indexed twice, under its
//! network id and under its pool subnet. The two key spaces are disjoint by
//! construction (subnets are CIDRs, ids are hashes), so a single map holds
//! both indices and they can never fall out of step.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::docker::NetworkResource;

struct GetReq {
    key: String,
    resp: oneshot::Sender<Option<Arc<NetworkResource>>>,
}

#[derive(Clone)]
pub struct ResourceCache {
    get_tx: mpsc::Sender<GetReq>,
    put_tx: mpsc::Sender<Arc<NetworkResource>>,
    del_tx: mpsc::Sender<String>,
}

impl ResourceCache {
    pub fn spawn() -> Self {
        let (get_tx, mut get_rx) = mpsc::channel::<GetReq>(16);
        let (put_tx, mut put_rx) = mpsc::channel::<Arc<NetworkResource>>(16);
        let (del_tx, mut del_rx) = mpsc::channel::<String>(16);

        tokio::spawn(async move {
            let mut cache: HashMap<String, Arc<NetworkResource>> = HashMap::new();
            loop {
                tokio::select! {
                    req = get_rx.recv() => {
                        let Some(req) = req else { break };
                        let _ = req.resp.send(cache.get(&req.key).cloned());
                    }
                    nr = put_rx.recv() => {
                        let Some(nr) = nr else { break };
                        // Entries without a subnet cannot be found by pool,
                        // so they are not cached at all.
                        let Some(pool) = nr.pool() else {
                            tracing::debug!(id = %nr.id, "network has no subnet, not caching");
                            continue;
                        };
                        cache.insert(nr.id.clone(), nr.clone());
                        cache.insert(pool, nr);
                    }
                    key = del_rx.recv() => {
                        let Some(key) = key else { break };
                        let Some(nr) = cache.remove(&key) else { continue };
                        if let Some(pool) = nr.pool() {
                            cache.remove(&pool);
                        }
                        cache.remove(&nr.id);
                    }
                }
            }
        });

        Self {
            get_tx,
            put_tx,
            del_tx,
        }
    }

    /// Look up by network id or by pool subnet.
    pub async fn get(&self, key: &str) -> Option<Arc<NetworkResource>> {
        let (resp, rx) = oneshot::channel();
        self.get_tx
            .send(GetReq {
                key: key.to_string(),
                resp,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn put(&self, nr: Arc<NetworkResource>) {
        let _ = self.put_tx.send(nr).await;
    }

    /// Evict by either key; both indices of the entry are removed.
    pub async fn delete(&self, key: &str) {
        let _ = self.del_tx.send(key.to_string()).await;
    }
}
