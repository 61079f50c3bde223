pub mod errors;
pub mod outbox;
pub mod ports;
