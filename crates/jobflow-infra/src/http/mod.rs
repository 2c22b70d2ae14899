//! HTTP adapters for the job and callback capabilities.
//!
//! Both speak a small vendor-neutral REST contract, so any job service or
//! callback receiver can sit behind a thin shim.

pub mod callback;
pub mod job_client;

pub use callback::HttpCallbackChannel;
pub use job_client::HttpJobClient;

use reqwest::Url;

/// Parse a configured endpoint that request paths are appended to.
fn parse_endpoint(endpoint: &str) -> Result<Url, String> {
    let url = Url::parse(endpoint).map_err(|e| format!("invalid endpoint '{endpoint}': {e}"))?;
    if url.cannot_be_a_base() {
        return Err(format!("invalid endpoint '{endpoint}': cannot carry a path"));
    }
    Ok(url)
}

/// `base` extended by `segments`. Job names and tokens are caller data, so
/// each one is percent-encoded as a single segment.
fn endpoint_url(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}
