pub mod connection;
pub mod probe;
pub mod scheduler;
pub mod transport;
