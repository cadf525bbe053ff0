//! The parallel router: each round dispatches up to `alpha` RPCs
//! concurrently, with total in-flight RPCs for the lookup bounded by a
//! `tokio::sync::Semaphore` sized to `max_threads`. This is the idiomatic
//! replacement for a fixed worker-thread pool draining a blocking queue:
//! `tokio::spawn` plus a semaphore gives the same bounded fan-out with
//! cancellation falling out of simply not awaiting a dropped task.

use super::{query_one_with_timeout, Frontier, LookupKind, LookupResult, QueryOutcome, Router};
use crate::config::PeerConfig;
use crate::contact::Contact;
use crate::id::Id;
use crate::protocol::Transport;
use crate::routing::BucketList;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub struct ParallelRouter {
    our_contact: Contact,
    bucket_list: Arc<BucketList>,
    transport: Arc<dyn Transport>,
    config: PeerConfig,
}

impl ParallelRouter {
    pub fn new(
        our_contact: Contact,
        bucket_list: Arc<BucketList>,
        transport: Arc<dyn Transport>,
        config: PeerConfig,
    ) -> Self {
        ParallelRouter {
            our_contact,
            bucket_list,
            transport,
            config,
        }
    }
}

#[async_trait]
impl Router for ParallelRouter {
    async fn lookup(&self, key: Id, kind: LookupKind) -> LookupResult {
        let our_id = self.bucket_list.our_id();
        let seeds = self.bucket_list.closest_k(&key, Some(&our_id));
        let mut frontier = Frontier::seed(our_id, key, seeds);
        let semaphore = Arc::new(Semaphore::new(self.config.max_threads));

        let mut round = 0u32;
        while !frontier.is_complete(self.config.k) {
            let batch = frontier.take_next(self.config.alpha);
            if batch.is_empty() {
                break;
            }
            round += 1;
            tracing::debug!(round, targets = batch.len(), %key, "lookup round");

            let mut tasks = Vec::with_capacity(batch.len());
            for target in batch {
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let transport = self.transport.clone();
                let our_contact = self.our_contact.clone();
                let timeout = self.config.request_timeout;
                tasks.push(tokio::spawn(async move {
                    let _permit = permit;
                    let outcome =
                        query_one_with_timeout(transport.as_ref(), &our_contact, &target, key, kind, timeout)
                            .await;
                    (target, outcome)
                }));
            }

            let results = futures::future::join_all(tasks).await;
            for joined in results {
                let (target, outcome) = match joined {
                    Ok(pair) => pair,
                    Err(_) => continue,
                };
                match outcome {
                    Ok(QueryOutcome::Value(value)) => {
                        return LookupResult {
                            found: true,
                            value: Some(value),
                            found_by: Some(target),
                            contacts: frontier.top_k(self.config.k),
                            discovered: frontier.discovered(),
                        };
                    }
                    Ok(QueryOutcome::Nodes(contacts)) => {
                        frontier.record_response(target, contacts);
                    }
                    Err(_) => {}
                }
            }
        }

        LookupResult {
            found: false,
            value: None,
            found_by: None,
            contacts: frontier.top_k(self.config.k),
            discovered: frontier.discovered(),
        }
    }
}
