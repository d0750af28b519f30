pub mod catalog;
pub mod control;
pub mod error;
pub mod event;
pub mod line;
pub mod registry;
pub mod stream;

pub use catalog::{ActionCatalog, ActionSpec};
pub use error::ProtocolError;
pub use event::Event;
pub use line::Line;
pub use registry::{sort_by_arrival, BatchClock, BatchId, Classification, EventRegistry};
pub use stream::StreamFramer;
