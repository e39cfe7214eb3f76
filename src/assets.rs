//! Model asset locations and fetching.

use std::{fmt, path::PathBuf, str::FromStr};

use anyhow::Context;
use url::Url;

/// Where a model asset lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetLocation {
    /// An `http://` or `https://` URL.
    Url(Url),
    /// A local file.
    Path(PathBuf),
}

impl AssetLocation {
    /// Fetches the asset's bytes.
    ///
    /// No retries are attempted.
    pub async fn fetch(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            Self::Url(url) => {
                log::debug!("fetching {url}");
                let response = reqwest::get(url.clone())
                    .await
                    .with_context(|| format!("failed to fetch {url}"))?
                    .error_for_status()
                    .with_context(|| format!("failed to fetch {url}"))?;
                let bytes = response
                    .bytes()
                    .await
                    .with_context(|| format!("failed to read response body of {url}"))?;
                Ok(bytes.to_vec())
            }
            Self::Path(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

impl FromStr for AssetLocation {
    type Err = anyhow::Error;

    /// Parses `http://` and `https://` strings as URLs and everything else as a path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            anyhow::bail!("empty asset location");
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            let url = Url::parse(s).with_context(|| format!("invalid asset URL '{s}'"))?;
            Ok(Self::Url(url))
        } else {
            Ok(Self::Path(PathBuf::from(s)))
        }
    }
}

impl fmt::Display for AssetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => write!(f, "{url}"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}
