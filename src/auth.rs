//! Bearer token acquisition.
//!
//! The client never talks to an identity provider itself. It asks a
//! [`TokenProvider`] for a token before each logical call and once more after
//! the server rejects it.

use async_trait::async_trait;
use std::future::Future;

/// Source of bearer tokens.
///
/// Returning `None` means no token could be obtained at all; the client fails
/// fast with [`Error::NoToken`](crate::Error::NoToken) without touching the
/// network.
///
/// Async closures returning `Option<String>` implement this trait:
///
/// ```
/// use listkeeper::TokenProvider;
///
/// fn assert_provider<P: TokenProvider>(_: P) {}
/// assert_provider(|| async { Some("token".to_string()) });
/// ```
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a token for the next request.
    async fn token(&self) -> Option<String>;

    /// Called after the server answered 401/403 to `rejected`.
    ///
    /// Providers that cache tokens should drop `rejected` and acquire a new
    /// one. The default asks [`token`](Self::token) again.
    async fn refresh(&self, rejected: &str) -> Option<String> {
        let _ = rejected;
        self.token().await
    }
}

#[async_trait]
impl<F, Fut> TokenProvider for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Option<String>> + Send,
{
    async fn token(&self) -> Option<String> {
        (self)().await
    }
}

/// A provider that always hands out the same token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wraps a fixed token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(..)")
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn closures_are_providers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let provider = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Some(format!("token-{n}")) }
        };

        assert_eq!(provider.token().await.as_deref(), Some("token-0"));
        assert_eq!(provider.refresh("token-0").await.as_deref(), Some("token-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_static_token_is_no_token() {
        assert_eq!(StaticToken::new("").token().await, None);
        assert_eq!(StaticToken::new("abc").token().await.as_deref(), Some("abc"));
    }
}
