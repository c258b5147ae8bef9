//! Rate limiting decisions for individual requests.

mod cache;
mod gate;
mod ignore;
mod key;
mod policy;
mod request;
mod stats;

pub use cache::{CacheError, CacheWrite, CachedDenial, LocalDecisionCache};
pub use gate::{is_enabled, Denial, Gate, GateOptions, Verdict, VerdictSource};
pub use ignore::should_ignore;
pub use key::{resolve, KeyExpression, NamespacedKey, DEFAULT_KEY};
pub use policy::{namespace_for_route, IgnoreRule, Policy};
pub use request::{RemoteAddr, RequestAttributes};
pub use stats::{GateStats, StatsSnapshot};
