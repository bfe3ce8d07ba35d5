// repo

mod message_repo;
mod profile_repo;

pub use message_repo::*;
pub use profile_repo::*;

// external services

mod blob_store;
mod change_feed;
mod session_provider;

pub use blob_store::*;
pub use change_feed::*;
pub use session_provider::*;
