//! Slide fetching: resolve a [`SlideSource`] to a local file.
//!
//! Remote slides are downloaded once into `<cache>/downloads/` and reused
//! verbatim on later runs: a flat existence check, no eviction.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::SlideSource;
use crate::error::HeatmapError;

/// Resolves slide sources to local files.
///
/// Seam for testing: the runner only depends on this trait, so tests can
/// substitute a fetcher that never touches the network.
pub trait SlideFetcher: Send + Sync {
    fn fetch(&self, source: &SlideSource, cache_dir: &Path) -> Result<PathBuf, HeatmapError>;
}

/// Production fetcher: local paths pass through, remote URLs are downloaded
/// into the cache directory with a blocking HTTP client.
pub struct CachingFetcher {
    client: reqwest::blocking::Client,
}

impl CachingFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Default for CachingFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SlideFetcher for CachingFetcher {
    fn fetch(&self, source: &SlideSource, cache_dir: &Path) -> Result<PathBuf, HeatmapError> {
        match source {
            SlideSource::Local(path) => {
                if !path.exists() {
                    return Err(HeatmapError::SlideFetch(format!(
                        "slide file not found: {}",
                        path.display()
                    )));
                }
                Ok(path.clone())
            }
            SlideSource::Remote(url) => {
                let file_name = remote_file_name(url);
                let download_dir = cache_dir.join("downloads");
                let target = download_dir.join(&file_name);

                if target.exists() {
                    debug!(url, path = %target.display(), "Reusing downloaded slide");
                    return Ok(target);
                }

                fs::create_dir_all(&download_dir)?;
                info!(url, "Downloading slide");

                let response = self
                    .client
                    .get(url)
                    .send()
                    .map_err(|e| HeatmapError::SlideFetch(format!("GET {url} failed: {e}")))?
                    .error_for_status()
                    .map_err(|e| HeatmapError::SlideFetch(format!("GET {url} failed: {e}")))?;

                let bytes = response
                    .bytes()
                    .map_err(|e| HeatmapError::SlideFetch(format!("read body of {url}: {e}")))?;

                // Write through a temp name so an interrupted download never
                // looks like a valid cache entry.
                let partial = download_dir.join(format!("{file_name}.partial"));
                let mut file = fs::File::create(&partial)?;
                file.write_all(&bytes)?;
                file.sync_all()?;
                fs::rename(&partial, &target)?;

                debug!(bytes = bytes.len(), path = %target.display(), "Slide downloaded");
                Ok(target)
            }
        }
    }
}

/// Last path segment of the URL, query string stripped.
fn remote_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("slide")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_path_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let slide = dir.path().join("case.tif");
        std::fs::write(&slide, b"not a real tiff").unwrap();

        let fetcher = CachingFetcher::new();
        let resolved = fetcher
            .fetch(&SlideSource::Local(slide.clone()), dir.path())
            .unwrap();
        assert_eq!(resolved, slide);
    }

    #[test]
    fn missing_local_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = CachingFetcher::new();
        let result = fetcher.fetch(
            &SlideSource::Local(dir.path().join("nope.tif")),
            dir.path(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn cached_download_is_reused_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&downloads).unwrap();
        std::fs::write(downloads.join("case-9.tif"), b"cached bytes").unwrap();

        // Unroutable host; only passes because the cache hit short-circuits.
        let fetcher = CachingFetcher::new();
        let resolved = fetcher
            .fetch(
                &SlideSource::Remote("https://invalid.invalid/wsi/case-9.tif".into()),
                dir.path(),
            )
            .unwrap();
        assert_eq!(resolved, downloads.join("case-9.tif"));
    }

    #[test]
    fn remote_file_name_strips_query() {
        assert_eq!(remote_file_name("https://x.org/a/b/c.tif?sig=1"), "c.tif");
        assert_eq!(remote_file_name("https://x.org/"), "slide");
    }
}
