use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

/// Source of the bearer token attached to every request.
///
/// Read once per request, so a rotated token takes effect on the next call.
pub trait CredentialSource: Send + Sync + 'static {
    fn bearer_token(&self) -> Option<String>;
}

/// No `Authorization` header.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl CredentialSource for Anonymous {
    fn bearer_token(&self) -> Option<String> {
        None
    }
}

/// Fixed token.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

impl CredentialSource for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        Some(self.0.clone()).filter(|token| !token.is_empty())
    }
}

/// Token shared with whatever performs the login; cloning shares the slot.
#[derive(Clone, Default)]
pub struct SharedToken {
    token: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token)),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl fmt::Debug for SharedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedToken")
            .field("present", &self.bearer_token().is_some())
            .finish()
    }
}

impl CredentialSource for SharedToken {
    fn bearer_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|token| !token.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_token_rotation_is_visible_to_clones() {
        let token = SharedToken::default();
        let reader = token.clone();
        assert_eq!(reader.bearer_token(), None);

        token.set("first");
        assert_eq!(reader.bearer_token().as_deref(), Some("first"));

        token.set("second");
        assert_eq!(reader.bearer_token().as_deref(), Some("second"));

        token.clear();
        assert_eq!(reader.bearer_token(), None);
    }

    #[test]
    fn empty_tokens_are_treated_as_absent() {
        assert_eq!(StaticToken::new("").bearer_token(), None);
        assert_eq!(SharedToken::new(Some(String::new())).bearer_token(), None);
        assert_eq!(Anonymous.bearer_token(), None);
    }

    #[test]
    fn debug_output_never_contains_the_token() {
        let rendered = format!(
            "{:?} {:?}",
            StaticToken::new("s3cr3t"),
            SharedToken::new(Some("s3cr3t".into()))
        );
        assert!(!rendered.contains("s3cr3t"));
    }
}
