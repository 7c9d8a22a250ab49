pub mod conversation;
pub mod error;
pub mod model;
pub mod sender;
