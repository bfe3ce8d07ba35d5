mod conversation;
mod event;
mod group;
mod message;
mod scope;
mod user;

pub use conversation::*;
pub use event::*;
pub use group::*;
pub use message::*;
pub use scope::*;
pub use user::*;
