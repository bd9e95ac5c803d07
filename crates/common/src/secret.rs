//! Secret wrapper for sensitive values such as upstream session cookies

use std::fmt;
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    /// Create a new secret value
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl Secret<String> {
    /// Short, log-safe fingerprint: the last `n` characters prefixed with `…`.
    ///
    /// Values no longer than `2 * n` are fully redacted so short test tokens
    /// never leak whole.
    pub fn fingerprint(&self, n: usize) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= n * 2 {
            return "[REDACTED]".to_string();
        }
        let tail: String = chars[chars.len() - n..].iter().collect();
        format!("…{tail}")
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
