mod messaging_session;

pub use messaging_session::*;
