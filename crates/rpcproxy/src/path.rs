use std::fmt;

use crate::error::ProxyError;

/// A fully qualified gRPC method path: `/{service}/{method}`
///
/// Example: `/echo.EchoService/Echo`
/// - `service`: `echo.EchoService`
/// - `method`: `Echo`
///
/// The service part may or may not carry a package prefix; `/Echo/Ping` is as
/// valid on the wire as `/com.example.Echo/Ping`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodPath {
    service: String,
    method: String,
}

impl MethodPath {
    /// Parse a method path as it appears in the `:path` pseudo-header.
    ///
    /// The leading slash is optional.
    pub fn parse(path: &str) -> Result<Self, ProxyError> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);

        let (service, method) = trimmed
            .split_once('/')
            .ok_or_else(|| ProxyError::InvalidPath(format!("missing '/' separator: '{path}'")))?;

        Self::new(service, method)
    }

    /// Build a method path from its service and method names.
    pub fn new(service: &str, method: &str) -> Result<Self, ProxyError> {
        validate_part(service, "service")?;
        validate_part(method, "method")?;

        Ok(MethodPath {
            service: service.to_owned(),
            method: method.to_owned(),
        })
    }

    /// Returns the fully qualified service name, e.g. `echo.EchoService`.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the bare method name, e.g. `Echo`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the package prefix of the service, if it has one.
    pub fn package(&self) -> Option<&str> {
        self.service.rsplit_once('.').map(|(package, _)| package)
    }

    /// Returns the full path: `/{service}/{method}`
    pub fn full_path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

impl fmt::Display for MethodPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.service, self.method)
    }
}

fn validate_part(part: &str, what: &str) -> Result<(), ProxyError> {
    if part.is_empty() {
        return Err(ProxyError::InvalidPath(format!("{what} name is empty")));
    }
    if part.contains('/') || part.chars().any(char::is_whitespace) {
        return Err(ProxyError::InvalidPath(format!(
            "{what} name contains '/' or whitespace: '{part}'"
        )));
    }
    Ok(())
}
