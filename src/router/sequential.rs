//! The sequential router: one round of up to `alpha` RPCs at a time, issued
//! one after another. Used for deterministic tests and low-resource peers;
//! produces the same `contacts` result as [`super::ParallelRouter`] on
//! inputs without RPC failures.

use super::{query_one_with_timeout, Frontier, LookupKind, LookupResult, QueryOutcome, Router};
use crate::config::PeerConfig;
use crate::contact::Contact;
use crate::id::Id;
use crate::protocol::Transport;
use crate::routing::BucketList;
use async_trait::async_trait;
use std::sync::Arc;

pub struct SequentialRouter {
    our_contact: Contact,
    bucket_list: Arc<BucketList>,
    transport: Arc<dyn Transport>,
    config: PeerConfig,
}

impl SequentialRouter {
    pub fn new(
        our_contact: Contact,
        bucket_list: Arc<BucketList>,
        transport: Arc<dyn Transport>,
        config: PeerConfig,
    ) -> Self {
        SequentialRouter {
            our_contact,
            bucket_list,
            transport,
            config,
        }
    }
}

#[async_trait]
impl Router for SequentialRouter {
    async fn lookup(&self, key: Id, kind: LookupKind) -> LookupResult {
        let our_id = self.bucket_list.our_id();
        let seeds = self.bucket_list.closest_k(&key, Some(&our_id));
        let mut frontier = Frontier::seed(our_id, key, seeds);

        let mut round = 0u32;
        while !frontier.is_complete(self.config.k) {
            let batch = frontier.take_next(self.config.alpha);
            if batch.is_empty() {
                break;
            }
            round += 1;
            tracing::debug!(round, targets = batch.len(), %key, "lookup round");
            for target in batch {
                let outcome = query_one_with_timeout(
                    self.transport.as_ref(),
                    &self.our_contact,
                    &target,
                    key,
                    kind,
                    self.config.request_timeout,
                )
                .await;
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
