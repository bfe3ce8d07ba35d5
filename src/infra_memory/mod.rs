mod blob_store_memory;
mod change_feed_memory;
mod database;
mod message_repo_memory;
mod profile_repo_memory;
mod session_provider_memory;

pub use blob_store_memory::*;
pub use change_feed_memory::*;
pub use database::*;
pub use message_repo_memory::*;
pub use profile_repo_memory::*;
pub use session_provider_memory::*;
