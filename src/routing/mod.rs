//! The routing table: k-buckets plus the splitting bucket list built from them.

pub mod bucket_list;
pub mod kbucket;

pub use bucket_list::{BucketList, ContactPinger, EvictionSink};
pub use kbucket::KBucket;
