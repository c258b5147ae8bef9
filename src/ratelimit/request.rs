//! Read-only view of the request attributes the gate consults.

use std::net::IpAddr;

/// Client address of a request, stored as a request extension by the
/// surrounding proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub IpAddr);

/// Request attributes needed to resolve keys and ignore rules.
pub trait RequestAttributes {
    /// First value of the named header, if present and valid UTF-8.
    /// Lookup is case-insensitive.
    fn header(&self, name: &str) -> Option<&str>;

    /// Address of the connected client.
    fn remote_addr(&self) -> Option<IpAddr>;

    /// Request path.
    fn path(&self) -> &str;

    /// Raw query string.
    fn query(&self) -> Option<&str>;

    /// Request host, from the `Host` header or the URI authority.
    fn host(&self) -> Option<&str>;
}

impl<B> RequestAttributes for http::Request<B> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    fn remote_addr(&self) -> Option<IpAddr> {
        self.extensions().get::<RemoteAddr>().map(|addr| addr.0)
    }

    fn path(&self) -> &str {
        self.uri().path()
    }

    fn query(&self) -> Option<&str> {
        self.uri().query()
    }

    fn host(&self) -> Option<&str> {
        self.header(http::header::HOST.as_str())
            .or_else(|| self.uri().host())
    }
}

impl RequestAttributes for http::request::Parts {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    fn remote_addr(&self) -> Option<IpAddr> {
        self.extensions.get::<RemoteAddr>().map(|addr| addr.0)
    }

    fn path(&self) -> &str {
        self.uri.path()
    }

    fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    fn host(&self) -> Option<&str> {
        self.header(http::header::HOST.as_str())
            .or_else(|| self.uri.host())
    }
}
