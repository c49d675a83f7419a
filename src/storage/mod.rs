mod blobs;
mod cleanup;
mod entries;
mod feeds;
mod jobs;
mod schema;
mod subscriptions;
mod types;

pub use blobs::BlobStore;
pub use entries::{trim_cutoff, MAX_FEED_BYTES, SUBSCRIPTION_LEASE_SECS};
pub use schema::Database;
pub use types::{
    format_millis, to_millis, ClaimedJob, DatabaseError, DispatchParams, Enclosure,
    EntryDocument, Feed, FeedEntry, IngestOutcome, Job, JobKind, JobStatus, NewEnclosure,
    NewEntry, OrphanEnclosure, Subscription,
};
