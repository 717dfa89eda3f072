//! Log sources
//!
//! A `LogSource` opens live tails on log destinations. Destinations that do
//! not exist yet are reported as `Error::NotFound` so callers can retry; any
//! other error is final for that destination.

use crate::api::{FilterLogEventsRequest, LiveTailRequest, LogApi};
use crate::log::{LiveEventStream, LogEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use crun_foundation::{LogsConfig, Result};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

/// A log group narrowed to some of its streams
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogDestination {
    /// Log group name or ARN (a trailing `:*` is accepted)
    pub log_group: String,
    /// Streams to include; empty means the whole group
    pub streams: Vec<String>,
}

impl LogDestination {
    pub fn new(log_group: impl Into<String>) -> Self {
        Self {
            log_group: log_group.into(),
            streams: Vec::new(),
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.streams.push(stream.into());
        self
    }

    /// Group identifier as the log APIs expect it
    pub fn group_identifier(&self) -> &str {
        self.log_group
            .strip_suffix(":*")
            .unwrap_or(&self.log_group)
    }
}

impl fmt::Display for LogDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.group_identifier())?;
        if !self.streams.is_empty() {
            write!(f, "[{}]", self.streams.join(","))?;
        }
        Ok(())
    }
}

/// Opens live tails, one per destination
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Open a live tail; `Error::NotFound` while the destination does not exist
    async fn open(&self, destination: &LogDestination) -> Result<LiveEventStream>;

    /// Open a live tail that first replays everything written since `since`.
    ///
    /// The history batch precedes every live event and live events already in
    /// the history are dropped.
    async fn open_since(
        &self,
        destination: &LogDestination,
        since: DateTime<Utc>,
    ) -> Result<LiveEventStream>;
}

/// `LogSource` over a log service API
pub struct CloudLogSource<L: LogApi> {
    api: Arc<L>,
    page_size: u32,
    limit: usize,
}

impl<L: LogApi> CloudLogSource<L> {
    pub fn new(api: Arc<L>) -> Self {
        let defaults = LogsConfig::default();
        Self {
            api,
            page_size: defaults.backfill_page_size,
            limit: defaults.backfill_limit,
        }
    }

    pub fn with_config(mut self, config: &LogsConfig) -> Self {
        self.page_size = config.backfill_page_size;
        self.limit = config.backfill_limit;
        self
    }

    /// Pages of events of `destination` from `since`, following `nextToken`
    pub fn pages<'a>(
        &'a self,
        destination: &'a LogDestination,
        since: DateTime<Utc>,
    ) -> Pin<Box<dyn Stream<Item = Result<Vec<LogEvent>>> + Send + 'a>> {
        Box::pin(async_stream::try_stream! {
            let mut next_token: Option<String> = None;
            loop {
                let page = self
                    .api
                    .filter_log_events(FilterLogEventsRequest {
                        log_group: destination.group_identifier().to_string(),
                        log_streams: destination.streams.clone(),
                        start_time: Some(since),
                        end_time: None,
                        limit: Some(self.page_size),
                        next_token: next_token.take(),
                    })
                    .await?;
                yield page.events;

                match page.next_token {
                    Some(token) => next_token = Some(token),
                    None => break,
                }
            }
        })
    }

    /// Events of `destination` from `since` up to now, in provider order,
    /// capped at the backfill limit
    pub async fn query(
        &self,
        destination: &LogDestination,
        since: DateTime<Utc>,
    ) -> Result<Vec<LogEvent>> {
        let mut pages = self.pages(destination, since);
        let mut events = Vec::new();
        while let Some(page) = pages.next().await {
            events.extend(page?);
            if events.len() >= self.limit {
                events.truncate(self.limit);
                break;
            }
        }

        debug!("backfilled {} events from {}", events.len(), destination);
        Ok(events)
    }
}

#[async_trait]
impl<L: LogApi> LogSource for CloudLogSource<L> {
    async fn open(&self, destination: &LogDestination) -> Result<LiveEventStream> {
        self.api
            .start_live_tail(LiveTailRequest {
                log_group: destination.group_identifier().to_string(),
                log_streams: destination.streams.clone(),
            })
            .await
    }

    async fn open_since(
        &self,
        destination: &LogDestination,
        since: DateTime<Utc>,
    ) -> Result<LiveEventStream> {
        // Live first, so nothing written after the history query is missed
        let stream = self.open(destination).await?;
        match self.query(destination, since).await {
            Ok(history) => Ok(stream.with_backfill(history)),
            Err(err) => {
                let _ = stream.close().await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LogEventsPage;
    use parking_lot::Mutex;

    /// Serves `total` events in pages of the requested size
    struct Paged {
        total: usize,
        requests: Mutex<Vec<FilterLogEventsRequest>>,
    }

    #[async_trait]
    impl LogApi for Paged {
        async fn start_live_tail(&self, _: LiveTailRequest) -> Result<LiveEventStream> {
            unimplemented!()
        }

        async fn filter_log_events(&self, request: FilterLogEventsRequest) -> Result<LogEventsPage> {
            let offset: usize = request.next_token.as_deref().map_or(0, |t| t.parse().unwrap());
            let end = (offset + request.limit.unwrap() as usize).min(self.total);
            self.requests.lock().push(request);
            Ok(LogEventsPage {
                events: (offset..end)
                    .map(|i| LogEvent::new("s", Utc::now(), format!("line {}", i)))
                    .collect(),
                next_token: (end < self.total).then(|| end.to_string()),
            })
        }
    }

    fn source(total: usize, page_size: u32, limit: usize) -> CloudLogSource<Paged> {
        let config = LogsConfig {
            backfill_page_size: page_size,
            backfill_limit: limit,
            ..Default::default()
        };
        CloudLogSource::new(Arc::new(Paged {
            total,
            requests: Mutex::new(Vec::new()),
        }))
        .with_config(&config)
    }

    #[test]
    fn test_query_follows_pages() {
        let source = source(5, 2, 100);
        let destination = LogDestination::new("group:*").with_stream("s");

        let events = tokio_test::block_on(source.query(&destination, Utc::now())).unwrap();
        assert_eq!(events.len(), 5);
        assert_eq!(events[4].message, "line 4");

        let requests = source.api.requests.lock();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[0].log_group, "group");
        assert_eq!(requests[2].next_token.as_deref(), Some("4"));
    }

    #[test]
    fn test_query_stops_at_limit() {
        let source = source(50, 4, 6);
        let events = tokio_test::block_on(source.query(&LogDestination::new("group"), Utc::now()))
            .unwrap();
        assert_eq!(events.len(), 6);
        assert_eq!(source.api.requests.lock().len(), 2);
    }

    #[test]
    fn test_destination_identifier() {
        let destination =
            LogDestination::new("arn:aws:logs:us-west-2:1:log-group:crun-LogGroup:*")
                .with_stream("crun/main/abc");
        assert_eq!(
            destination.group_identifier(),
            "arn:aws:logs:us-west-2:1:log-group:crun-LogGroup"
        );
        assert_eq!(
            destination.to_string(),
            "arn:aws:logs:us-west-2:1:log-group:crun-LogGroup[crun/main/abc]"
        );
        assert_eq!(LogDestination::new("group").to_string(), "group");
    }
}
