//! Realtime layer of the canvas: a `yrs` document holding the graph, an on-disk replica for
//! offline use, collaborator presence and the client session tying them to a relay.

pub mod debounce;
pub mod doc;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod session;
pub mod throttle;

pub use debounce::{Debouncer, DEFAULT_SAVE_DEBOUNCE};
pub use doc::{CanvasDoc, BLOCKS_MAP, CONTENTS_MAP, LINKS_MAP};
pub use error::SyncError;
pub use presence::{Presence, PresenceRegistry, Viewport};
pub use protocol::{ControlMessage, Frame};
pub use replica::LocalReplica;
pub use session::{CanvasSession, ConnectionStatus};
pub use throttle::{Throttle, DEFAULT_AWARENESS_INTERVAL};
