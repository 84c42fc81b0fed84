//! The agent's REST surface.

pub mod router;
pub mod service;

pub use router::UrlRouter;
pub use service::HttpService;
