pub mod client;
pub mod events;
pub mod types;

pub use client::{ByteStream, RemoteClient};
pub use events::run_subscriber;
pub use types::{FsChangeEvent, RemoteDirent, VolumeStats};
