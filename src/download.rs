//! Checkpoint downloads over HTTP.
//!
//! Google Drive serves large files behind an HTML "can't scan for viruses"
//! page; [`HttpDownloader`] follows that page's confirmation form once before
//! giving up.

use regex::Regex;
use reqwest::blocking::{Client, Response};
use reqwest::header::CONTENT_TYPE;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::common::progress::create_download_bar;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} returned an HTML page instead of a file")]
    HtmlPage { url: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub trait Downloader {
    /// Fetch `url` into `destination`, returning the number of bytes written.
    fn download(&self, url: &str, destination: &Path) -> Result<u64, DownloadError>;
}

pub struct HttpDownloader {
    client: Client,
    show_progress: bool,
}

impl HttpDownloader {
    pub fn new(show_progress: bool) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(format!("lipsync/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self {
            client,
            show_progress,
        })
    }

    fn get(&self, url: &str) -> Result<Response, DownloadError> {
        let response = self.client.get(url).send()?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, destination: &Path) -> Result<u64, DownloadError> {
        let mut response = self.get(url)?;

        if is_html(&response) {
            let body = response.text()?;
            let confirmed = drive_confirmation_url(url, &body).ok_or_else(|| {
                DownloadError::HtmlPage {
                    url: url.to_string(),
                }
            })?;
            response = self.get(&confirmed)?;
            if is_html(&response) {
                return Err(DownloadError::HtmlPage { url: confirmed });
            }
        }

        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| url.to_string());
        let pb = create_download_bar(response.content_length(), name);
        if !self.show_progress {
            pb.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        }

        let mut file = File::create(destination)?;
        let mut reader = pb.wrap_read(response);
        let written = io::copy(&mut reader, &mut file);
        pb.finish_and_clear();
        let written = written?;
        file.sync_all()?;

        Ok(written)
    }
}

fn is_html(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/html"))
}

static FORM_ACTION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"action="([^"]+)""#).ok());
static HIDDEN_INPUT_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"<input[^>]*type="hidden"[^>]*name="([^"]+)"[^>]*value="([^"]*)""#).ok()
});
static CONFIRM_TOKEN_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"confirm=([0-9A-Za-z_-]+)").ok());

/// Build the URL that skips Google Drive's virus-scan interstitial.
///
/// Newer pages carry a form posting hidden inputs to
/// `drive.usercontent.google.com`; older ones embed a `confirm=` token in a
/// link back to the original URL.
fn drive_confirmation_url(original: &str, body: &str) -> Option<String> {
    let action_re = FORM_ACTION_RE.as_ref()?;
    let input_re = HIDDEN_INPUT_RE.as_ref()?;

    if let Some(action) = action_re.captures(body).map(|c| c[1].replace("&amp;", "&")) {
        let params: Vec<(String, String)> = input_re
            .captures_iter(body)
            .map(|c| (c[1].to_string(), c[2].to_string()))
            .collect();
        if !params.is_empty() {
            return reqwest::Url::parse_with_params(&action, &params)
                .ok()
                .map(String::from);
        }
    }

    let token_re = CONFIRM_TOKEN_RE.as_ref()?;
    let token = token_re.captures(body)?.get(1)?.as_str().to_string();
    let mut url = reqwest::Url::parse(original).ok()?;
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != "confirm")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("confirm", &token);
    Some(url.into())
}
