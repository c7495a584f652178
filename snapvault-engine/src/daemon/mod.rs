//! Process lifecycle helpers for long-running commands.

pub mod shutdown;

pub use shutdown::ShutdownCoordinator;
