//! Local RPC handlers: the four operations a peer performs when another
//! peer's request arrives, plus the bucket-list update every one of them
//! triggers on receipt.

use crate::config::PeerConfig;
use crate::contact::Contact;
use crate::error::Error;
use crate::protocol::{RequestBody, RequestHandler, ResponseBody};
use crate::routing::{BucketList, ContactPinger, EvictionSink};
use crate::storage::Storage;
use async_trait::async_trait;
use std::sync::{Arc, Weak};

pub struct Node {
    our_contact: Contact,
    bucket_list: Arc<BucketList>,
    originator: Arc<dyn Storage>,
    republish: Arc<dyn Storage>,
    cache: Arc<dyn Storage>,
    pinger: Weak<dyn ContactPinger>,
    eviction: Weak<dyn EvictionSink>,
    config: PeerConfig,
}

impl Node {
    pub fn new(
        our_contact: Contact,
        bucket_list: Arc<BucketList>,
        originator: Arc<dyn Storage>,
        republish: Arc<dyn Storage>,
        cache: Arc<dyn Storage>,
        pinger: Weak<dyn ContactPinger>,
        eviction: Weak<dyn EvictionSink>,
        config: PeerConfig,
    ) -> Self {
        Node {
            our_contact,
            bucket_list,
            originator,
            republish,
            cache,
            pinger,
            eviction,
            config,
        }
    }

    pub fn our_contact(&self) -> &Contact {
        &self.our_contact
    }

    pub fn bucket_list(&self) -> &Arc<BucketList> {
        &self.bucket_list
    }

    pub fn republish_store(&self) -> &Arc<dyn Storage> {
        &self.republish
    }

    pub fn originator_store(&self) -> &Arc<dyn Storage> {
        &self.originator
    }

    pub fn cache_store(&self) -> &Arc<dyn Storage> {
        &self.cache
    }

    async fn learn(&self, sender: Contact) -> Result<(), Error> {
        if sender.id == self.our_contact.id {
            return Err(Error::SelfContact);
        }
        let pinger = self.pinger.upgrade();
        let eviction = self.eviction.upgrade();
        if let (Some(pinger), Some(eviction)) = (pinger, eviction) {
            self.bucket_list
                .add_contact(sender, pinger.as_ref(), eviction.as_ref())
                .await?;
        }
        Ok(())
    }

    pub async fn ping(&self, sender: Contact) -> ResponseBody {
        if self.learn(sender).await.is_err() {
            return ResponseBody::Error {
                error_message: "sender is self".to_string(),
            };
        }
        ResponseBody::Ack
    }

    pub async fn store(
        &self,
        sender: Contact,
        key: crate::id::Id,
        value: Vec<u8>,
        is_cached: bool,
        expiration_time_sec: u64,
    ) -> ResponseBody {
        if self.learn(sender).await.is_err() {
            return ResponseBody::Error {
                error_message: "sender is self".to_string(),
            };
        }
        let ttl = expiration_time_sec.min(self.config.expiration_ttl_secs);
        let store = if is_cached { &self.cache } else { &self.republish };
        match store.set(key, value, ttl).await {
            Ok(()) => ResponseBody::Ack,
            Err(e) => ResponseBody::Error {
                error_message: e.to_string(),
            },
        }
    }

    pub async fn find_node(&self, sender: Contact, key: crate::id::Id) -> ResponseBody {
        let sender_id = sender.id;
        if self.learn(sender).await.is_err() {
            return ResponseBody::Error {
                error_message: "sender is self".to_string(),
            };
        }
        let contacts = self.bucket_list.closest_k(&key, Some(&sender_id));
        ResponseBody::Nodes { contacts }
    }

    pub async fn find_value(&self, sender: Contact, key: crate::id::Id) -> ResponseBody {
        let sender_id = sender.id;
        if self.learn(sender).await.is_err() {
            return ResponseBody::Error {
                error_message: "sender is self".to_string(),
            };
        }
        if let Some(value) = self.republish.try_get(&key).await {
            return ResponseBody::Value {
                contacts: Vec::new(),
                value: Some(value),
            };
        }
        if let Some(value) = self.cache.try_get(&key).await {
            return ResponseBody::Value {
                contacts: Vec::new(),
                value: Some(value),
            };
        }
        let contacts = self.bucket_list.closest_k(&key, Some(&sender_id));
        ResponseBody::Value {
            contacts,
            value: None,
        }
    }
}

#[async_trait]
impl RequestHandler for Node {
    #[tracing::instrument(skip(self, body), fields(sender = %sender.id))]
    async fn handle(&self, sender: Contact, body: RequestBody) -> ResponseBody {
        match body {
            RequestBody::Ping => self.ping(sender).await,
            RequestBody::Store {
                key,
                value,
                is_cached,
                expiration_time_sec,
            } => {
                self.store(sender, key, value, is_cached, expiration_time_sec)
                    .await
            }
            RequestBody::FindNode { key } => self.find_node(sender, key).await,
            RequestBody::FindValue { key } => self.find_value(sender, key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::Endpoint;
    use crate::id::Id;
    use crate::storage::MemoryStorage;

    struct AlwaysAlive;
    #[async_trait]
    impl ContactPinger for AlwaysAlive {
        async fn ping(&self, _contact: &Contact) -> bool {
            true
        }
    }
    struct NoopEviction;
    impl EvictionSink for NoopEviction {
        fn delay_eviction(&self, _victim: Contact, _replacement: Contact) {}
        fn add_pending(&self, _low: Id, _high: Id, _replacement: Contact) {}
    }

    fn make_node(our_id: Id) -> Node {
        let bucket_list = Arc::new(BucketList::new(our_id, 20, 5));
        let pinger: Arc<dyn ContactPinger> = Arc::new(AlwaysAlive);
        let eviction: Arc<dyn EvictionSink> = Arc::new(NoopEviction);
        Node::new(
            Contact::new(our_id, Endpoint::Channel(0)),
            bucket_list,
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
            Arc::downgrade(&pinger),
            Arc::downgrade(&eviction),
            PeerConfig::test_defaults(),
        )
    }

    #[tokio::test]
    async fn find_node_never_returns_the_requester() {
        let our_id = Id::random();
        let node = make_node(our_id);
        let requester = Contact::new(Id::random(), Endpoint::Channel(1));
        let requester_id = requester.id;
        let response = node.find_node(requester, Id::random()).await;
        match response {
            ResponseBody::Nodes { contacts } => {
                assert!(contacts.iter().all(|c| c.id != requester_id));
            }
            _ => panic!("unexpected response"),
        }
    }

    #[tokio::test]
    async fn store_then_find_value_returns_it() {
        let our_id = Id::random();
        let node = make_node(our_id);
        let sender = Contact::new(Id::random(), Endpoint::Channel(1));
        let key = Id::random();
        let resp = node
            .store(sender.clone(), key, b"v".to_vec(), false, 3600)
            .await;
        assert!(matches!(resp, ResponseBody::Ack));
        let resp = node.find_value(sender, key).await;
        match resp {
            ResponseBody::Value { value, .. } => assert_eq!(value, Some(b"v".to_vec())),
            _ => panic!("unexpected response"),
        }
    }
}
