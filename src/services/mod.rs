pub mod baseline;
pub mod memory_item;
pub mod practice_event;
pub mod recommendation;
pub mod session;
pub mod srs;
