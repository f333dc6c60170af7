pub mod signaling;
pub mod status;

pub use signaling::offer;
pub use status::{index, remove_session, status};
