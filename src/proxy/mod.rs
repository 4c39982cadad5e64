pub mod context;
mod handler;

pub use context::BoxBody;
pub use handler::{build_proxy_client, handle_request, ProxyClient};
