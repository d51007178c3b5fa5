//! Rate limiting primitives and the per-key registry.

mod api;
mod bucket;
mod buffered;
mod clock;
mod limiter;
mod registry;
pub mod rules;

pub use api::{ConfigExtractor, LimitedApi};
pub use bucket::RefillMode;
pub use buffered::{Acquire, BufferedAsyncLimiter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::TokenBucketLimiter;
pub use registry::{ExceededListener, LimitLevel, RateLimitKey, RateLimitRegistry};
pub use rules::{merge, parse_config, parse_limits, RateLimitEntry};
