//! Network probes and downloads
//!
//! Status and header probes never fail: anything unreachable reports
//! status `0` and an empty header map. Downloads return an error value
//! instead of aborting so the caller can log it and move on.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;

use crate::config::FeedConfig;

/// Options for a single download
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Suppress the progress bar
    pub quiet: bool,
    /// Continue a partial download if one exists
    pub resume: bool,
}

/// Status and declared size of a URL
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Head {
    pub status: u16,
    pub content_length: u64,
}

/// Remote metadata and transfer collaborator
pub trait Probe {
    /// HTTP status of a URL after redirects; `0` when unreachable
    fn status(&self, url: &str) -> u16;

    /// Response headers of a URL with lowercased names
    fn headers(&self, url: &str) -> HashMap<String, String>;

    /// Download a URL to `dest`, creating parent directories
    fn fetch(&self, url: &str, dest: &Path, options: FetchOptions) -> Result<PathBuf>;

    /// Declared size of a URL; `0` without a content-length header
    fn content_length(&self, url: &str) -> u64 {
        self.headers(url)
            .get("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Status and declared size together
    fn head(&self, url: &str) -> Head {
        Head {
            status: self.status(url),
            content_length: self.content_length(url),
        }
    }
}

/// Probe backed by a blocking HTTP client
pub struct HttpProbe {
    /// Client for HEAD probes (bounded timeout)
    client: Client,
    /// Client for downloads (no overall timeout)
    download_client: Client,
}

impl HttpProbe {
    pub fn new(feed: &FeedConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(feed.timeout_secs))
            .user_agent(feed.user_agent.clone())
            .build()?;

        let download_client = Client::builder()
            .timeout(None)
            .connect_timeout(Duration::from_secs(feed.timeout_secs))
            .user_agent(feed.user_agent.clone())
            .build()?;

        Ok(Self {
            client,
            download_client,
        })
    }
}

impl Probe for HttpProbe {
    fn status(&self, url: &str) -> u16 {
        match self.client.head(url).send() {
            Ok(response) => {
                let status = response.status().as_u16();
                tracing::debug!("HEAD {} ({})", url, status);
                status
            }
            Err(e) => {
                tracing::debug!("HEAD {} failed: {}", url, e);
                0
            }
        }
    }

    fn head(&self, url: &str) -> Head {
        match self.client.head(url).send() {
            Ok(response) => {
                let content_length = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0);
                let status = response.status().as_u16();
                tracing::debug!("HEAD {} ({}, {} bytes)", url, status, content_length);
                Head {
                    status,
                    content_length,
                }
            }
            Err(e) => {
                tracing::debug!("HEAD {} failed: {}", url, e);
                Head::default()
            }
        }
    }

    fn headers(&self, url: &str) -> HashMap<String, String> {
        let mut result = HashMap::new();

        match self.client.head(url).send() {
            Ok(response) => {
                for (name, value) in response.headers() {
                    if let Ok(value) = value.to_str() {
                        result.insert(name.as_str().to_lowercase(), value.trim().to_string());
                    }
                }
            }
            Err(e) => tracing::debug!("HEAD {} failed: {}", url, e),
        }

        tracing::debug!("{} headers: {:?}", url, result);
        result
    }

    fn fetch(&self, url: &str, dest: &Path, options: FetchOptions) -> Result<PathBuf> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // Only packages are resumed; manifests are always fetched whole
        let offset = if options.resume && url.contains(".pkg") {
            fs::metadata(dest).map(|m| m.len()).unwrap_or(0)
        } else {
            0
        };

        let mut request = self.download_client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let mut response = request
            .send()
            .with_context(|| format!("Failed to fetch {}", url))?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
            tracing::debug!("{} already complete", dest.display());
            return Ok(dest.to_path_buf());
        }
        if !status.is_success() {
            bail!("HTTP {} for {}", status.as_u16(), url);
        }

        let append = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(dest)
            .with_context(|| format!("Failed to open {}", dest.display()))?;

        let already = if append { offset } else { 0 };
        let total = response.content_length().map(|len| len + already);

        let bar = if options.quiet {
            ProgressBar::hidden()
        } else {
            let bar = ProgressBar::new(total.unwrap_or(0));
            if let Ok(style) = ProgressStyle::default_bar().template(
                "  {bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
            ) {
                bar.set_style(style.progress_chars("=>-"));
            }
            bar
        };
        bar.set_position(already);

        let mut writer = bar.wrap_write(file);
        io::copy(&mut response, &mut writer)
            .with_context(|| format!("Failed while downloading {}", url))?;
        writer.flush()?;
        bar.finish_and_clear();

        tracing::debug!("Fetched {} to {}", url, dest.display());
        Ok(dest.to_path_buf())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeProbe;
    use super::*;

    #[test]
    fn test_content_length_defaults_to_zero() {
        let probe = FakeProbe::new().with("https://example.org/a.pkg", 200, 42);
        assert_eq!(probe.content_length("https://example.org/a.pkg"), 42);
        assert_eq!(probe.content_length("https://example.org/missing.pkg"), 0);
        assert_eq!(probe.status("https://example.org/missing.pkg"), 0);
        assert_eq!(
            probe.head("https://example.org/a.pkg"),
            Head {
                status: 200,
                content_length: 42
            }
        );
    }

    #[test]
    fn test_unreachable_host_reports_zero() {
        let probe = HttpProbe::new(&FeedConfig {
            timeout_secs: 1,
            ..FeedConfig::default()
        })
        .unwrap();
        assert_eq!(probe.status("not a url"), 0);
        assert!(probe.headers("not a url").is_empty());
        assert_eq!(probe.head("not a url"), Head::default());
    }
}
