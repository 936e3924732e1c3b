pub mod docs;
pub mod http_client;
pub mod http_handler;
pub mod middleware;

pub use http_client::HttpClientAdapter;
pub use http_handler::HttpHandler;
pub use middleware::CorsPolicy;
