use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::FirestoreResult;
use crate::util::lock;

/// Supplies the tokens attached to every stream the client opens.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Called after the backend rejected a token; the next
    /// [`get_token`](Self::get_token) should fetch a fresh one.
    fn invalidate_token(&self);
}

pub type CredentialsProviderArc = Arc<dyn CredentialsProvider>;

#[derive(Clone, Debug, Default)]
pub struct NoopCredentialsProvider;

#[async_trait]
impl CredentialsProvider for NoopCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

/// Hands out a fixed token that callers may swap at any time.
///
/// There is no token source to refresh from. After an invalidation the next
/// [`get_token`](CredentialsProvider::get_token) counts as a refresh and
/// returns whatever token is currently set.
#[derive(Debug, Default)]
pub struct StaticCredentialsProvider {
    token: Mutex<Option<String>>,
    invalidations: AtomicUsize,
    force_refresh: AtomicBool,
    refreshes: AtomicUsize,
}

impl StaticCredentialsProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
            invalidations: AtomicUsize::new(0),
            force_refresh: AtomicBool::new(false),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn set_token(&self, token: Option<String>) {
        *lock(&self.token) = token;
    }

    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    /// Number of token reads that followed an invalidation.
    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        if self.force_refresh.swap(false, Ordering::SeqCst) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            log::debug!("re-reading static token after invalidation");
        }
        Ok(lock(&self.token).clone())
    }

    fn invalidate_token(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.force_refresh.store(true, Ordering::SeqCst);
    }
}

pub const AUTHORIZATION_HEADER: &str = "Authorization";
pub const APP_CHECK_HEADER: &str = "X-Firebase-AppCheck";

/// Request headers carrying the auth and App Check tokens, when present.
pub async fn credential_headers(
    auth: &dyn CredentialsProvider,
    app_check: &dyn CredentialsProvider,
) -> FirestoreResult<Vec<(String, String)>> {
    let mut headers = Vec::new();
    if let Some(token) = auth.get_token().await? {
        headers.push((AUTHORIZATION_HEADER.to_string(), format!("Bearer {token}")));
    }
    if let Some(token) = app_check.get_token().await? {
        headers.push((APP_CHECK_HEADER.to_string(), token));
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn headers_include_available_tokens() {
        let auth = StaticCredentialsProvider::new("id-token");
        let headers = credential_headers(&auth, &NoopCredentialsProvider).await.unwrap();
        assert_eq!(
            headers,
            vec![(AUTHORIZATION_HEADER.to_string(), "Bearer id-token".to_string())]
        );

        let app_check = StaticCredentialsProvider::new("attestation");
        auth.set_token(None);
        let headers = credential_headers(&auth, &app_check).await.unwrap();
        assert_eq!(headers, vec![(APP_CHECK_HEADER.to_string(), "attestation".to_string())]);
    }

    #[test]
    fn invalidation_is_counted() {
        let auth = StaticCredentialsProvider::new("t");
        auth.invalidate_token();
        auth.invalidate_token();
        assert_eq!(auth.invalidation_count(), 2);
    }

    #[tokio::test]
    async fn token_read_after_invalidation_is_a_refresh() {
        let auth = StaticCredentialsProvider::new("old");
        auth.get_token().await.unwrap();
        assert_eq!(auth.refresh_count(), 0);

        auth.invalidate_token();
        auth.set_token(Some("new".to_string()));
        assert_eq!(auth.get_token().await.unwrap().as_deref(), Some("new"));
        assert_eq!(auth.refresh_count(), 1);

        auth.get_token().await.unwrap();
        assert_eq!(auth.refresh_count(), 1);
    }
}
