//! Error type shared by the site contract and extractors.

use crate::fetch::FetchError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("Invalid URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("No site handler for {url}")]
    NoHandler { url: String },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Unexpected page structure at {url}: {message}")]
    Structure { url: String, message: String },

    #[error("Invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },

    #[error("Invalid site definition {path}: {reason}")]
    Definition { path: PathBuf, reason: String },

    #[error("No chapters found at {url} (possibly deleted or access restricted).")]
    EmptyStory { url: String },

    #[error("Login to {site} failed: {reason}")]
    Login { site: String, reason: String },
}
