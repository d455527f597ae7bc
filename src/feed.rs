//! Client side of the streaming feed: connection parameters, the client
//! seam used by the ingestion bridge and its HTTP implementation.

use crate::record::{BoundingBox, FilterPredicates};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::io::{BufRead, BufReader};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Failures talking to the feed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    /// Connecting or reading failed below HTTP
    #[error("transport error: {0}")]
    Transport(String),

    /// The feed answered with a non-success status
    #[error("feed returned HTTP {status}")]
    Http { status: u16 },

    /// The stream, which should never end, ended
    #[error("feed stream ended")]
    EndOfStream,
}

impl FeedError {
    /// Whether reconnecting after a backoff can help. Rejected credentials
    /// cannot.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            FeedError::Http {
                status: 401 | 403
            }
        )
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => FeedError::Http {
                status: status.as_u16(),
            },
            None => FeedError::Transport(e.to_string()),
        }
    }
}

/// A live stream of raw lines. The iterator ending means the connection
/// dropped.
pub type FeedLines = Box<dyn Iterator<Item = Result<String, FeedError>> + Send>;

/// Terms the feed filters on server-side. No terms means the sample stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedParams {
    pub follow: Vec<u64>,
    pub track: Vec<String>,
    pub locations: Vec<BoundingBox>,
    pub language: Vec<String>,
}

impl FeedParams {
    pub fn is_empty(&self) -> bool {
        self.follow.is_empty()
            && self.track.is_empty()
            && self.locations.is_empty()
            && self.language.is_empty()
    }

    /// Form fields, comma separated, omitting empty ones
    pub fn form(&self) -> Vec<(&'static str, String)> {
        let join = |values: Vec<String>| values.join(",");
        let fields = [
            ("follow", join(self.follow.iter().map(u64::to_string).collect())),
            ("track", join(self.track.clone())),
            (
                "locations",
                join(self.locations.iter().map(BoundingBox::to_param).collect()),
            ),
            ("language", join(self.language.clone())),
        ];
        fields.into_iter().filter(|(_, v)| !v.is_empty()).collect()
    }
}

impl From<&FilterPredicates> for FeedParams {
    fn from(predicates: &FilterPredicates) -> Self {
        Self {
            follow: predicates.follow.iter().copied().collect(),
            track: predicates.track.iter().cloned().collect(),
            locations: predicates.locations.clone(),
            language: predicates.language.iter().cloned().collect(),
        }
    }
}

/// Opens a streaming connection to the feed
pub trait FeedClient: Send {
    fn connect(&mut self, params: &FeedParams) -> Result<FeedLines, FeedError>;
}

/// [`FeedClient`] over HTTP: `GET` for the sample stream, form `POST` when
/// there are filter terms
pub struct HttpFeedClient {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpFeedClient {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, FeedError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

impl FeedClient for HttpFeedClient {
    fn connect(&mut self, params: &FeedParams) -> Result<FeedLines, FeedError> {
        let mut request = if params.is_empty() {
            self.client.get(&self.url)
        } else {
            let body = serde_urlencoded::to_string(params.form())
                .map_err(|e| FeedError::Transport(e.to_string()))?;
            self.client
                .post(&self.url)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(body)
        };
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send()?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FeedError::Http {
                status: status.as_u16(),
            });
        }
        info!(url = %self.url, "connected to feed");

        Ok(feed_lines(BufReader::new(response)))
    }
}

/// Split a feed body into lines. Lines that are not valid UTF-8 are dropped
/// here so one bad line never costs a reconnect.
fn feed_lines(reader: impl BufRead + Send + 'static) -> FeedLines {
    Box::new(reader.split(b'\n').filter_map(|line| match line {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(mut line) => {
                if line.ends_with('\r') {
                    line.pop();
                }
                Some(Ok(line))
            }
            Err(_) => {
                debug!("skipping feed line that is not valid UTF-8");
                None
            }
        },
        Err(e) => Some(Err(FeedError::Transport(e.to_string()))),
    }))
}
