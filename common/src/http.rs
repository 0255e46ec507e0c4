use std::io::Read;

use crate::error::TransportError;

pub const HTTP_OK: u16 = 200;

/// Sent on every request so proxies and CDNs never hand back a stale
/// version file or image.
pub const NO_CACHE_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-cache, no-store, must-revalidate"),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

pub struct HttpResponse<B> {
    pub status: u16,
    pub content_length: Option<u64>,
    pub body: B,
}

/// Blocking HTTP GET. Each call opens its own connection, which is closed
/// when the returned body is dropped.
pub trait HttpTransport {
    type Body: Read;

    fn get(
        &mut self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse<Self::Body>, TransportError>;
}
