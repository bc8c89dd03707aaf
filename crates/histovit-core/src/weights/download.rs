//! Checkpoint downloading from the published release.

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::catalog::ModelVariant;
use crate::error::{Error, Result};

/// Fetches released weight files into a local cache directory.
///
/// One file per variant; a present file is trusted and reused without any
/// network access. There is no retry or resume logic here; transport errors
/// surface to the caller unmodified.
pub struct WeightDownloader {
    weights_dir: PathBuf,
    http_client: Client,
}

impl WeightDownloader {
    pub fn new(weights_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&weights_dir)?;

        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(3600)) // 1 hour timeout for large files
            .build()
            .map_err(|e| Error::Download(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            weights_dir,
            http_client,
        })
    }

    pub fn weights_dir(&self) -> &Path {
        &self.weights_dir
    }

    /// Local cache path for a variant's checkpoint.
    pub fn weight_path(&self, variant: ModelVariant) -> PathBuf {
        self.weights_dir.join(variant.weight_filename())
    }

    /// Whether a variant's checkpoint is already cached.
    pub fn is_cached(&self, variant: ModelVariant) -> bool {
        self.weight_path(variant).is_file()
    }

    /// Return the cached checkpoint, downloading it first if needed.
    pub fn fetch(&self, variant: ModelVariant) -> Result<PathBuf> {
        let dest = self.weight_path(variant);
        if dest.is_file() {
            debug!("Checkpoint already cached: {:?}", dest);
            return Ok(dest);
        }

        let url = variant.weight_url();
        info!("Downloading {} from {}", variant.display_name(), url);

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap(),
        );
        pb.set_message(format!("Downloading {}", variant.display_name()));

        self.download_file_http(&url, &dest)?;

        pb.finish_with_message(format!("Downloaded {}", variant.display_name()));
        Ok(dest)
    }

    fn download_file_http(&self, url: &str, dest: &Path) -> Result<()> {
        debug!("Downloading from URL: {}", url);

        let response = self
            .http_client
            .get(url)
            .header("User-Agent", "histovit/0.1.0")
            .send()
            .map_err(|e| Error::Download(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Download(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = response
            .bytes()
            .map_err(|e| Error::Download(format!("Failed to read response: {}", e)))?;

        let mut file = File::create(dest)?;
        file.write_all(&bytes)?;

        debug!("Downloaded {} bytes to {:?}", bytes.len(), dest);
        Ok(())
    }
}
