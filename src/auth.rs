//! Token-based request authorization.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// HTTP methods the API answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Method {
    Get,
    Head,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            other => Err(StoreError::InvalidRequest(format!("unsupported method {other}"))),
        }
    }
}

/// What a token may do.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grant {
    /// Every method (`*`).
    Any,
    Methods(BTreeSet<Method>),
}

impl Grant {
    /// Parse `*` or a comma-separated method list such as `GET,HEAD`.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        if s.trim() == "*" {
            return Ok(Grant::Any);
        }
        s.split(',')
            .map(|m| m.trim().parse())
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Grant::Methods)
    }

    pub fn allows(&self, method: Method) -> bool {
        match self {
            Grant::Any => true,
            Grant::Methods(methods) => methods.contains(&method),
        }
    }
}

/// Token table. An empty table means the store is open to everyone.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    tokens: HashMap<String, Grant>,
}

impl AuthConfig {
    /// Open access.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, grant: Grant) -> Self {
        self.tokens.insert(token.into(), grant);
        self
    }

    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn is_authorized(&self, token: Option<&str>, method: Method) -> bool {
        if self.is_open() {
            return true;
        }
        token
            .and_then(|t| self.tokens.get(t))
            .map_or(false, |grant| grant.allows(method))
    }
}
