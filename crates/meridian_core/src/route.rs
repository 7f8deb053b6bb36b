//! Capability routes of the form `serverType.category.method`.

use crate::error::RouteError;
use std::fmt;

/// A parsed route. The server type selects the process pool; the
/// `category.method` pair selects the handler inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub server_type: String,
    pub category: String,
    pub method: String,
}

impl Route {
    /// Parses a route. Exactly three dot-separated tokens are required; a token
    /// may be empty, in which case nothing will be registered to serve it.
    pub fn parse(route: &str) -> Result<Self, RouteError> {
        let mut tokens = route.split('.');
        match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
            (Some(server_type), Some(category), Some(method), None) => Ok(Self {
                server_type: server_type.to_string(),
                category: category.to_string(),
                method: method.to_string(),
            }),
            _ => Err(RouteError(route.to_string())),
        }
    }

    /// The `category.method` key handlers are registered under.
    pub fn handler_key(&self) -> String {
        format!("{}.{}", self.category, self.method)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.server_type, self.category, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_three_tokens() {
        let route = Route::parse("hall.userHandler.updateUserAddress").unwrap();
        assert_eq!(route.server_type, "hall");
        assert_eq!(route.handler_key(), "userHandler.updateUserAddress");
        assert_eq!(route.to_string(), "hall.userHandler.updateUserAddress");
    }

    #[test]
    fn rejects_wrong_token_counts() {
        for bad in ["foo.bar", "a.b.c.d", "", "single", "a.b.c.", "..."] {
            assert!(Route::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn empty_tokens_still_count() {
        let route = Route::parse("a..b").unwrap();
        assert_eq!(route.server_type, "a");
        assert_eq!(route.category, "");
        assert_eq!(route.handler_key(), ".b");

        let route = Route::parse(".b.c").unwrap();
        assert_eq!(route.server_type, "");
        assert_eq!(route.to_string(), ".b.c");
    }
}
