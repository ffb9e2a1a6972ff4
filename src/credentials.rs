//! Credential sources for the hub connection.
//!
//! The channel pulls a token at every connection and reconnection attempt and
//! never holds on to it, so a source that refreshes its token is picked up on
//! the next attempt.

use std::collections::HashMap;
use std::sync::RwLock;

/// Default name of the session cookie carrying the bearer token
pub const DEFAULT_COOKIE_NAME: &str = "jwtToken";

/// Supplies the current bearer token. `None` disables the channel.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// Fixed token, mostly for tools and tests
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Reads the token from an environment variable on every call
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl TokenSource for EnvToken {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var).ok().filter(|t| !t.trim().is_empty())
    }
}

/// Session cookie jar. Login stores cookies, logout clears them.
#[derive(Debug)]
pub struct SessionCookies {
    name: String,
    cookies: RwLock<HashMap<String, String>>,
}

impl SessionCookies {
    /// Empty jar reading the token from cookie `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cookies: RwLock::new(HashMap::new()),
        }
    }

    /// Jar initialised from a `Cookie` header value (`a=1; jwtToken=...`)
    pub fn from_header(name: impl Into<String>, header: &str) -> Self {
        let jar = Self::new(name);
        jar.merge_header(header);
        jar
    }

    pub fn merge_header(&self, header: &str) {
        let parsed = parse_cookie_header(header);
        if let Ok(mut cookies) = self.cookies.write() {
            cookies.extend(parsed);
        }
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        if let Ok(mut cookies) = self.cookies.write() {
            cookies.insert(name.into(), value.into());
        }
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        self.cookies.write().ok().and_then(|mut c| c.remove(name))
    }

    pub fn clear(&self) {
        if let Ok(mut cookies) = self.cookies.write() {
            cookies.clear();
        }
    }
}

impl Default for SessionCookies {
    fn default() -> Self {
        Self::new(DEFAULT_COOKIE_NAME)
    }
}

impl TokenSource for SessionCookies {
    fn token(&self) -> Option<String> {
        let cookies = self.cookies.read().ok()?;
        cookies.get(&self.name).filter(|v| !v.is_empty()).cloned()
    }
}

/// Parse a `Cookie` header into name/value pairs. Values are percent-decoded.
pub fn parse_cookie_header(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            let value = value.trim().trim_matches('"');
            let value = urlencoding::decode(value)
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string());
            Some((name.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_cookie_header() {
        let cookies = parse_cookie_header("theme=dark; jwtToken=abc.def.ghi ; empty=; =junk; flag");
        assert_eq!(cookies.get("theme").map(String::as_str), Some("dark"));
        assert_eq!(cookies.get("jwtToken").map(String::as_str), Some("abc.def.ghi"));
        assert_eq!(cookies.get("empty").map(String::as_str), Some(""));
        assert!(!cookies.contains_key(""));
        assert!(!cookies.contains_key("flag"));
    }

    #[test]
    fn test_parse_cookie_percent_encoded() {
        let cookies = parse_cookie_header("jwtToken=a%2Bb%3D%3D");
        assert_eq!(cookies.get("jwtToken").map(String::as_str), Some("a+b=="));
    }

    #[test]
    fn test_session_cookies_login_logout() {
        let jar = SessionCookies::default();
        assert_eq!(jar.token(), None);

        jar.merge_header("sid=1; jwtToken=first");
        assert_eq!(jar.token().as_deref(), Some("first"));

        jar.set("jwtToken", "rotated");
        assert_eq!(jar.token().as_deref(), Some("rotated"));

        jar.set("jwtToken", "");
        assert_eq!(jar.token(), None);

        jar.set("jwtToken", "again");
        jar.clear();
        assert_eq!(jar.token(), None);
    }

    #[test]
    fn test_custom_cookie_name() {
        let jar = SessionCookies::from_header("auth", "jwtToken=x; auth=y");
        assert_eq!(jar.token().as_deref(), Some("y"));
        assert_eq!(jar.remove("auth").as_deref(), Some("y"));
        assert_eq!(jar.token(), None);
    }

    #[test]
    fn test_static_and_closure_sources() {
        assert_eq!(StaticToken::new("t").token().as_deref(), Some("t"));
        assert_eq!(StaticToken::none().token(), None);

        let source = || Some("from-closure".to_string());
        assert_eq!(TokenSource::token(&source).as_deref(), Some("from-closure"));
    }

    #[test]
    #[serial]
    fn test_env_token() {
        let source = EnvToken::new("VET_NOTIFY_TEST_TOKEN");
        std::env::remove_var("VET_NOTIFY_TEST_TOKEN");
        assert_eq!(source.token(), None);

        std::env::set_var("VET_NOTIFY_TEST_TOKEN", "  ");
        assert_eq!(source.token(), None);

        std::env::set_var("VET_NOTIFY_TEST_TOKEN", "env-token");
        assert_eq!(source.token().as_deref(), Some("env-token"));
        std::env::remove_var("VET_NOTIFY_TEST_TOKEN");
    }
}
