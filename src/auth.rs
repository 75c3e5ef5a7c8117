use std::collections::HashMap;

/// API token for one CI server. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Token(***)")
    }
}

/// The caller's identity and per-server tokens.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    principal: String,
    tokens: HashMap<String, Token>,
    anonymous_servers: Vec<String>,
}

impl Credentials {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_token(mut self, server_id: impl Into<String>, token: Token) -> Self {
        self.tokens.insert(server_id.into(), token);
        self
    }

    /// Grants access to a server that accepts unauthenticated requests.
    #[must_use]
    pub fn with_anonymous(mut self, server_id: impl Into<String>) -> Self {
        self.anonymous_servers.push(server_id.into());
        self
    }

    /// Scope under which cached results computed for this caller are shared.
    pub fn scope(&self) -> &str {
        &self.principal
    }

    pub fn token(&self, server_id: &str) -> Option<&Token> {
        self.tokens.get(server_id)
    }

    pub fn has_server(&self, server_id: &str) -> bool {
        self.tokens.contains_key(server_id) || self.anonymous_servers.iter().any(|s| s == server_id)
    }
}
