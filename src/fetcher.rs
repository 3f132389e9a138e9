//! # Remote Bundle Fetcher
//!
//! Thin wrapper over a blocking HTTP GET. The chunk cache hands it a URL and
//! a reuse buffer; the response body is appended to that buffer so the cache
//! keeps ownership of its one-slot memory areas. Retries and timeouts are
//! intentionally left to the operator rerunning the command.

use log::debug;

use crate::common::{QuarryError, QuarryResult};

/// Performs a blocking GET of `url`, appending the body to `buffer`.
pub fn fetch(url: &str, buffer: &mut Vec<u8>) -> QuarryResult<()> {
    debug!("fetching {}", url);
    let mut response = reqwest::blocking::get(url)?;
    if !response.status().is_success() {
        return Err(QuarryError::Http(format!(
            "GET {} returned {}",
            url,
            response.status()
        )));
    }
    response
        .copy_to(buffer)
        .map_err(|e| QuarryError::Http(format!("{:?}", e)))?;
    Ok(())
}
