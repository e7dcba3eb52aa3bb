//! Request dispatch for the `/api/v1` REST contract.
//!
//! [`Api`] turns a transport-neutral [`Request`] into a [`Response`] by
//! calling the store. Binding it to an HTTP server is left to the caller;
//! nothing here does network I/O.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::auth::Method;
use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::types::{Hash, ModulePath};

/// Every route lives under this prefix.
pub const API_PREFIX: &str = "/api/v1";

/// Bearer-style token header.
pub const AUTH_HEADER: &str = "Wasmstore-Auth";

/// Selects the branch a request operates on.
pub const BRANCH_HEADER: &str = "Wasmstore-Branch";

/// Carries the content hash on module reads.
pub const HASH_HEADER: &str = "Wasmstore-Hash";

/// An incoming request.
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    /// Full request path, e.g. `/api/v1/module/foo/bar.wasm`.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An outgoing response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::ok()
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::bytes(body.into().into_bytes())
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::bytes(serde_json::to_vec(value)?)
            .with_header("Content-Type", "application/json"))
    }

    /// Status from the error's kind, body from its message.
    pub fn error(err: &StoreError) -> Self {
        Self {
            status: err.status_code(),
            headers: Vec::new(),
            body: err.to_string().into_bytes(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Maps requests onto a shared store.
#[derive(Clone)]
pub struct Api {
    store: Arc<Store>,
}

impl Api {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Handle one request. Failures become responses carrying the error's
    /// status code.
    pub fn handle(&self, request: &Request) -> Response {
        match self.dispatch(request) {
            Ok(response) => response,
            Err(err) => {
                debug!(method = %request.method, path = %request.path, error = %err, "request failed");
                Response::error(&err)
            }
        }
    }

    fn dispatch(&self, request: &Request) -> Result<Response> {
        let route = request
            .path
            .split('?')
            .next()
            .unwrap_or_default()
            .strip_prefix(API_PREFIX)
            .ok_or_else(|| StoreError::RouteNotFound(request.path.clone()))?;
        let route = route.trim_start_matches('/');
        let (endpoint, rest) = route.split_once('/').unwrap_or((route, ""));

        let method = request.method;
        let token = request.header(AUTH_HEADER);
        if !self.store.auth().is_authorized(token, method) {
            return Err(StoreError::Unauthorized(method.to_string()));
        }

        let branch = request
            .header(BRANCH_HEADER)
            .unwrap_or_else(|| self.store.default_branch());

        match (method, endpoint) {
            (Method::Get, "module") => self.find_module(branch, rest),
            (Method::Head, "module") => {
                let path = ModulePath::parse(rest)?;
                if self.store.contains(branch, &path)? {
                    Ok(Response::ok())
                } else {
                    Err(StoreError::PathNotFound(path))
                }
            }
            (Method::Post, "module") => {
                let hash = self
                    .store
                    .add(branch, &ModulePath::parse(rest)?, &request.body)?;
                Ok(Response::text(hash.to_hex()))
            }
            (Method::Delete, "module") => {
                let path = ModulePath::parse(rest)?;
                if self.store.remove(branch, &path)? {
                    Ok(Response::ok())
                } else {
                    Err(StoreError::PathNotFound(path))
                }
            }
            (Method::Get, "hash") => {
                let path = ModulePath::parse(rest)?;
                match self.store.hash(branch, &path)? {
                    Some(hash) => Ok(Response::text(hash.to_hex())),
                    None => Err(StoreError::PathNotFound(path)),
                }
            }
            (Method::Post, "hash") => {
                let (hash, path) = split_hash(rest)?;
                self.store.set_hash(branch, &path, hash)?;
                Ok(Response::text(hash.to_hex()))
            }
            (Method::Get, "snapshot") => {
                let commit = self.store.snapshot(branch)?;
                Ok(Response::text(commit.to_hex()))
            }
            (Method::Post, "restore") => {
                let (commit, path) = split_hash(rest)?;
                self.store.restore(branch, &commit, &path)?;
                Ok(Response::ok())
            }
            (Method::Post, "rollback") => {
                self.store.rollback(branch, &ModulePath::parse(rest)?)?;
                Ok(Response::ok())
            }
            (Method::Post, "merge") => {
                let source = single_segment(rest, "merge")?;
                self.store.merge(source, branch)?;
                Ok(Response::ok())
            }
            (Method::Post, "gc") => {
                self.store.gc()?;
                Ok(Response::ok())
            }
            (Method::Post, "branch") => {
                let name = single_segment(rest, "branch")?;
                self.store.create_branch(name, Some(branch))?;
                Ok(Response::ok())
            }
            (Method::Delete, "branch") => {
                self.store.delete_branch(single_segment(rest, "branch")?)?;
                Ok(Response::ok())
            }
            (Method::Get, "branches") => Response::json(&self.store.branch_names()),
            (Method::Get, "versions") => {
                let versions = self.store.versions(branch, &ModulePath::parse(rest)?)?;
                // `[content, commit]`, or `[content]` while only staged.
                let entries: Vec<Vec<String>> = versions
                    .into_iter()
                    .map(|v| {
                        std::iter::once(v.content)
                            .chain(v.commit)
                            .map(|hash| hash.to_hex())
                            .collect()
                    })
                    .collect();
                Response::json(&entries)
            }
            (Method::Get, "modules") => {
                let listing: BTreeMap<String, String> = self
                    .store
                    .list(branch, &ModulePath::parse(rest)?)?
                    .into_iter()
                    .map(|(path, hash)| (path.to_string(), hash.to_hex()))
                    .collect();
                Response::json(&listing)
            }
            (Method::Get, "commit") => {
                let hash: Hash = single_segment(rest, "commit")?.parse()?;
                Response::json(&self.store.commit_info(&hash)?)
            }
            // Authorization for the request's method was checked above.
            (_, "auth") => Ok(Response::ok()),
            _ => Err(StoreError::RouteNotFound(format!("{method} {}", request.path))),
        }
    }

    /// Module at a path; a lone segment that is a stored content hash
    /// returns that content directly.
    fn find_module(&self, branch: &str, rest: &str) -> Result<Response> {
        let path = ModulePath::parse(rest)?;
        if let Some((bytes, hash)) = self.store.find(branch, &path)? {
            return Ok(Response::bytes(bytes).with_header(HASH_HEADER, hash.to_hex()));
        }

        if let [segment] = path.segments() {
            if let Ok(hash) = segment.parse::<Hash>() {
                if let Some(bytes) = self.store.find_by_hash(&hash)? {
                    return Ok(Response::bytes(bytes).with_header(HASH_HEADER, hash.to_hex()));
                }
            }
        }

        Err(StoreError::PathNotFound(path))
    }
}

/// `{hash}` or `{hash}/{path}`; a missing path is the root.
fn split_hash(rest: &str) -> Result<(Hash, ModulePath)> {
    let rest = rest.trim_start_matches('/');
    let (hash, path) = rest.split_once('/').unwrap_or((rest, ""));
    Ok((hash.parse()?, ModulePath::parse(path)?))
}

fn single_segment<'a>(rest: &'a str, endpoint: &str) -> Result<&'a str> {
    let name = rest.trim_matches('/');
    if name.is_empty() || name.contains('/') {
        return Err(StoreError::InvalidRequest(format!(
            "{endpoint} expects exactly one path segment"
        )));
    }
    Ok(name)
}
