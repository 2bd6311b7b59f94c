//! Static file serving
//!
//! Plain HTTP requests are answered from a directory holding the client
//! bundle. Directory requests resolve to their `index.html`; paths escaping
//! the root are refused.

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use tower::ServiceExt;
use tower_http::services::ServeDir;

/// Body type of every response the server writes
pub type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

/// Serves files below a root directory
#[derive(Clone)]
pub struct StaticFiles {
    root: PathBuf,
    service: ServeDir,
}

impl StaticFiles {
    /// Serve files from `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            service: ServeDir::new(&root).append_index_html_on_directories(true),
            root,
        }
    }

    /// Answer a GET or HEAD request; other methods get a 405
    pub async fn respond<B>(&self, req: Request<B>) -> Response<ResponseBody>
    where
        B: Send + 'static,
    {
        match self.service.clone().oneshot(req).await {
            Ok(response) => response.map(|body| body.boxed_unsync()),
            Err(never) => match never {},
        }
    }
}

impl fmt::Debug for StaticFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticFiles")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
