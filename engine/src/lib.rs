//! The accrual polling engine and its supporting machinery: a bounded
//! worker pool, a retunable token-bucket limiter, an in-process event bus,
//! and the poller that drives per-order tasks against the accrual authority.

pub mod bus;
pub mod limiter;
pub mod poller;
pub mod pool;

pub use bus::EventBus;
pub use bus::SubscriptionId;
pub use limiter::RateLimiter;
pub use poller::AccrualPoller;
pub use poller::EnqueueError;
pub use poller::PollerConfig;
pub use pool::PoolClosed;
pub use pool::WorkerPool;
