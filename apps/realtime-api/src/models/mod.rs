pub mod connection_request;
pub mod conversation;
pub mod message;
