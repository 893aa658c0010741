pub mod handlers;
pub mod ohlcv;

pub use handlers::{ApiState, RestUrls, cors_layer, create_api_router};
