pub mod capabilities;
pub mod environment;
pub mod probe;
pub mod ws_handler;
