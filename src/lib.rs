//! storyleech: harvest serialized web fiction into EPUB books.

pub mod cli;
pub mod config;
pub mod cover;
pub mod epub;
pub mod fetch;
pub mod footnote;
pub mod logging;
pub mod markup;
pub mod model;
pub mod options;
pub mod sites;

// Re-exports for CLI and consumers.
pub use epub::{write_epub, EpubError, EpubFile, EpubMeta, EpubVersion, WriteOptions};
pub use fetch::{FetchError, Fetcher, FetcherBuilder, Page, RetryPolicy, Session};
pub use footnote::FootnoteRegistry;
pub use model::{Chapter, Entry, Image, Section, Story};
pub use options::{OptionLayers, OptionMap, ResolvedOptions, SiteOption};
pub use sites::{open_story, Registry, RunState, Site, SiteContext, SiteError};
