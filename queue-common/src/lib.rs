pub mod memory;
pub mod message;
pub mod pgmq;
pub mod queue;
