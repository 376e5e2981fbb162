//! Backend task dispatcher: a TCP server answering one framed request per
//! connection from a fixed pool of workers.

pub mod pool;
pub mod server;
pub mod worker;

// Re-export common types
pub use self::pool::{WorkerCommand, WorkerPool};
pub use self::server::{run_server, Dispatcher};
pub use self::worker::run_worker;
