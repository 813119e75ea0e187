// Lifecycle of the vendor server executable.

pub mod process;

pub use process::{ProcessError, ServerProcess, Supervisor};
