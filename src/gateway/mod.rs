//! Front-end HTTP service: validates scrape requests, applies admission
//! control, fetches the page and, in full mode, hands it to the dispatcher.

pub mod client;
pub mod error;
pub mod fetch;
pub mod parser;
pub mod server;

// Re-export common types
pub use self::client::{page_params, DispatcherClient};
pub use self::fetch::PageFetcher;
pub use self::server::{connect_store, serve, AppState};
