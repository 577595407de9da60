pub mod admission;
pub mod clock;
pub mod config;
pub mod history;
pub mod limiter;
pub mod window;

pub use admission::{Admission, Unlimited};
pub use config::{ConfigError, LimiterConfig};
pub use limiter::{LimiterState, Permit, WindowLimiter};
pub use window::{adjust_limit, WindowKind};
