pub mod command;
pub mod play;
pub mod probe;
pub mod progress;
