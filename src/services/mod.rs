pub mod files;
pub mod notify;
pub mod secrets;
pub mod store;

pub use files::{FileInfo, FileStore, LocalFileStore};
pub use notify::{BroadcastSink, LogSink, NotificationSink, NullSink, ScanEvent};
pub use secrets::{AesSecretStore, SecretStore};
pub use store::{JsonStore, Store};
