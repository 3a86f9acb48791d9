pub mod blob;
pub mod container;
pub mod delegate;
pub mod error;
pub mod events;
pub mod facade;
pub mod gate;
pub mod payload;
pub mod record;
pub mod store;

pub use crate::blob::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use crate::container::RecordContainer;
pub use crate::delegate::{PushDelegate, PushHandler, PushProvider};
pub use crate::error::StoreError;
pub use crate::events::{EventBus, EventKind, StoreEvent};
pub use crate::facade::{Notificator, Storage, Subscription};
pub use crate::record::NotificationRecord;
pub use crate::store::NotificationStore;
