use std::sync::Arc;

/// Хранилище токенов для HTTP клиента.
/// The session layer lives in the host; it pushes tokens here after login/refresh.
#[derive(Clone, Default)]
pub struct AuthManager {
    access_token: Arc<tokio::sync::RwLock<Option<String>>>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_token(&self, access_token: Option<String>) {
        *self.access_token.write().await = access_token.filter(|t| !t.is_empty());
    }

    pub async fn get_access_token(&self) -> Result<String, String> {
        self.access_token
            .read()
            .await
            .clone()
            .ok_or_else(|| "Access token not set. Call set_auth_token first.".to_string())
    }

    pub async fn clear(&self) {
        *self.access_token.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_lifecycle() {
        let auth = AuthManager::new();
        assert!(auth.get_access_token().await.is_err());

        auth.set_token(Some("abc".into())).await;
        assert_eq!(auth.get_access_token().await.unwrap(), "abc");

        auth.clear().await;
        assert!(auth.get_access_token().await.is_err());
    }

    #[tokio::test]
    async fn test_empty_token_is_unset() {
        let auth = AuthManager::new();
        auth.set_token(Some(String::new())).await;
        assert!(auth.get_access_token().await.is_err());
    }
}
