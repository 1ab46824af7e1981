pub mod models;
pub use models::*;

mod broadcaster;
pub use broadcaster::*;

mod live;
pub use live::poll_live_sse;
