//! HTTP front end that validates social-media URLs and relays `yt-dlp`
//! metadata, previews and downloads to the browser.

pub mod app;
pub mod config;
pub mod download;
pub mod error;
pub mod info;
pub mod job_dir;
pub mod preview;
pub mod stream;
pub mod tool;
pub mod url_policy;
