mod remote;

pub use remote::{ApiErrorClass, RemoteClient, RemoteError, RemoteItem, RemoteItemKind};
