// Sign-in landing: tokens and the sign-up marker arrive as query parameters
// after the external identity provider redirects back

use crate::navigation::Location;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthCallback {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// The provider created a new account on this sign-in
    pub sign_up: bool,
}

impl AuthCallback {
    pub fn from_location(location: &Location) -> Self {
        let non_empty = |key: &str| location.query_param(key).filter(|v| !v.is_empty());

        Self {
            access_token: non_empty("accessToken"),
            refresh_token: non_empty("refreshToken"),
            sign_up: location
                .query_param("signUp")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }

    pub fn has_tokens(&self) -> bool {
        self.access_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_callback() {
        let loc = Location::parse("/oauth/callback?accessToken=a1&refreshToken=r1&signUp=TRUE");
        let cb = AuthCallback::from_location(&loc);
        assert_eq!(cb.access_token.as_deref(), Some("a1"));
        assert_eq!(cb.refresh_token.as_deref(), Some("r1"));
        assert!(cb.sign_up);
        assert!(cb.has_tokens());
    }

    #[test]
    fn test_cookie_session_callback() {
        let cb = AuthCallback::from_location(&Location::parse("/oauth/callback?signUp=false"));
        assert!(!cb.has_tokens());
        assert!(!cb.sign_up);

        let cb = AuthCallback::from_location(&Location::parse("/oauth/callback?accessToken="));
        assert_eq!(cb, AuthCallback::default());
    }
}
