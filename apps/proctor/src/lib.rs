pub mod api;
pub mod cli;
pub mod config;
pub mod gate;
pub mod pairing;
pub mod signaling;
pub mod status;
pub mod telemetry;
pub mod transport;

pub use proctor_wire as wire;
