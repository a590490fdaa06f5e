pub mod debounce;
pub mod graceful_shutdown;

pub use debounce::ChangeDebouncer;
pub use graceful_shutdown::ShutdownSignal;
