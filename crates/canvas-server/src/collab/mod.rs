pub mod document;
pub mod websocket;

pub use document::{DocumentStore, Outbound, ProjectDocument};
pub use websocket::router;
