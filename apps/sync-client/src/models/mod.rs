pub mod message;
pub mod operation;
pub mod room;
