//! Session-cookie pool for the Kilo upstream
//!
//! Holds the configured cookies and their availability, hands out a
//! randomized candidate list per inbound request, and classifies in-band
//! upstream rejection text.
//!
//! Cookie lifecycle:
//! 1. Cookies are read once at startup → all `Available`
//! 2. A request builds its own candidate list from the `Available` cookies
//! 3. Upstream reports a rate limit → `RateLimited` until the lock expires
//! 4. Upstream reports billing exhaustion (and reactivation cannot help) → `Evicted`
//! 5. Lock expires → back to `Available`, checked lazily at the next candidate build

pub mod candidates;
pub mod classify;
pub mod error;
pub mod pool;

pub use candidates::CandidateList;
pub use classify::{classify, classify_terminal};
pub use error::{Error, Result};
pub use pool::{Cookie, CookiePool, CookieStatus};
