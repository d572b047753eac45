//! facetag-store — Storage clients for the face pipeline.
//!
//! Filesystem object buckets for photos and face crops, the SQLite `photos`
//! metadata table, and the SQLite-backed crop task queue.

mod db;
pub mod face_store;
pub mod object_store;
pub mod task_queue;

pub use face_store::{FaceStats, FaceStore, FaceStoreError};
pub use object_store::{FsObjectStore, ObjectStore, ObjectStoreError};
pub use task_queue::{
    DeadLetter, QueueError, QueueStats, ReceivedMessage, Release, SqliteTaskQueue, TaskQueue,
};
