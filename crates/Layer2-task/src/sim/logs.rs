//! Simulated log groups and live tails

use super::{Inner, SimCloud, SimState};
use crate::api::{FilterLogEventsRequest, LiveTailRequest, LogApi, LogEventsPage};
use crate::log::{LiveEventStream, LogEvent, TailEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crun_foundation::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_PAGE_SIZE: usize = 10_000;

/// Group name from a name or ARN (`arn:...:log-group:<name>[:*]`)
fn group_name(identifier: &str) -> &str {
    let identifier = identifier.strip_suffix(":*").unwrap_or(identifier);
    match identifier.split_once(":log-group:") {
        Some((_, name)) => name,
        None => identifier,
    }
}

/// Counts a running live-tail producer until dropped
struct OpenTail(Arc<Inner>);

impl OpenTail {
    fn new(inner: Arc<Inner>) -> Self {
        *inner.open_tails.lock() += 1;
        Self(inner)
    }
}

impl Drop for OpenTail {
    fn drop(&mut self) {
        *self.0.open_tails.lock() -= 1;
    }
}

impl SimState {
    /// Group exists and every named stream has been created
    fn check_destination(&self, group: &str, streams: &[String], now: DateTime<Utc>) -> Result<()> {
        if !self.log_groups.contains_key(group) {
            return Err(Error::NotFound(format!("log group {}", group)));
        }
        for stream in streams {
            let exists = self
                .tasks
                .values()
                .any(|t| t.log_group == group && &t.stream == stream && t.stream_exists(now));
            if !exists {
                return Err(Error::NotFound(format!("log stream {}", stream)));
            }
        }
        Ok(())
    }

    /// Lines of `group` written up to `now`, per stream, in write order
    fn streams(
        &self,
        group: &str,
        streams: &[String],
        now: DateTime<Utc>,
    ) -> HashMap<String, Vec<LogEvent>> {
        self.tasks
            .values()
            .filter(|t| t.log_group == group && t.stream_exists(now))
            .filter(|t| streams.is_empty() || streams.contains(&t.stream))
            .map(|t| {
                let events = t
                    .written(now)
                    .into_iter()
                    .map(|(i, ts, line)| {
                        LogEvent::new(t.stream.clone(), ts, line).with_id(format!("{}:{}", t.stream, i))
                    })
                    .collect();
                (t.stream.clone(), events)
            })
            .collect()
    }
}

fn interleave(streams: HashMap<String, Vec<LogEvent>>) -> Vec<LogEvent> {
    let mut events: Vec<LogEvent> = streams.into_values().flatten().collect();
    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.event_id.cmp(&b.event_id))
    });
    events
}

#[async_trait]
impl LogApi for SimCloud {
    async fn start_live_tail(&self, request: LiveTailRequest) -> Result<LiveEventStream> {
        let group = group_name(&request.log_group).to_string();
        let streams = request.log_streams.clone();

        // Lines already written are history, not part of the session
        let mut delivered: HashMap<String, usize> = {
            let state = self.inner.state.lock();
            let now = Utc::now();
            state.check_destination(&group, &streams, now)?;
            state
                .streams(&group, &streams, now)
                .into_iter()
                .map(|(stream, events)| (stream, events.len()))
                .collect()
        };

        let (tx, rx) = mpsc::channel(16);
        let token = CancellationToken::new();
        let closer = token.clone();
        let open = OpenTail::new(Arc::clone(&self.inner));
        let session_id = uuid::Uuid::new_v4().to_string();
        debug!("sim: live tail {} on {}", session_id, group);

        tokio::spawn(async move {
            let inner = Arc::clone(&open.0);
            if tx
                .send(Ok(TailEvent::SessionStart { session_id }))
                .await
                .is_err()
            {
                return;
            }

            let mut ticker = tokio::time::interval(inner.tail_poll_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = tx.closed() => return,
                    _ = ticker.tick() => {}
                }

                let batch = {
                    let state = inner.state.lock();
                    if !state.log_groups.contains_key(&group) {
                        // group deleted: the provider ends the session
                        return;
                    }
                    let mut fresh = HashMap::new();
                    for (stream, events) in state.streams(&group, &streams, Utc::now()) {
                        let seen = delivered.entry(stream.clone()).or_insert(0);
                        if events.len() > *seen {
                            let new_events = events[*seen..].to_vec();
                            *seen = events.len();
                            fresh.insert(stream, new_events);
                        }
                    }
                    interleave(fresh)
                };

                if batch.is_empty() {
                    continue;
                }
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    sent = tx.send(Ok(TailEvent::Update(batch))) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(LiveEventStream::new(request.log_group, rx, Arc::new(closer)))
    }

    async fn filter_log_events(&self, request: FilterLogEventsRequest) -> Result<LogEventsPage> {
        let group = group_name(&request.log_group);
        let state = self.inner.state.lock();
        if !state.log_groups.contains_key(group) {
            return Err(Error::NotFound(format!("log group {}", group)));
        }

        let events: Vec<LogEvent> = interleave(state.streams(group, &request.log_streams, Utc::now()))
            .into_iter()
            .filter(|e| request.start_time.map_or(true, |start| e.timestamp >= start))
            .filter(|e| request.end_time.map_or(true, |end| e.timestamp <= end))
            .collect();

        let offset = match &request.next_token {
            Some(token) => token.parse::<usize>().map_err(|_| {
                Error::api("logs", "InvalidParameterException", "The specified nextToken is invalid.")
            })?,
            None => 0,
        };
        let limit = request
            .limit
            .map(|l| l as usize)
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let end = (offset + limit).min(events.len());
        let page = events.get(offset..end).map(<[LogEvent]>::to_vec).unwrap_or_default();

        Ok(LogEventsPage {
            events: page,
            next_token: (end < events.len()).then(|| end.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        AwsVpcConfig, ComputeApi, ContainerOverride, CreateStackRequest, LaunchType, OnFailure,
        RunTaskRequest, StackApi,
    };
    use crate::container::ContainerSpec;
    use crate::sim::TaskScript;
    use crate::template::{render, TemplateOptions};
    use std::time::Duration;

    /// Provision, launch one scripted task and return (log group ARN, stream)
    async fn launch(sim: &SimCloud, script: TaskScript) -> (String, String) {
        let body = render("crun", &[ContainerSpec::new("alpine")], &TemplateOptions::default()).unwrap();
        sim.create_stack(CreateStackRequest {
            stack_name: "crun".into(),
            template_body: body,
            parameters: vec![],
            termination_protection: true,
            on_failure: OnFailure::Delete,
        })
        .await
        .unwrap();
        sim.describe_stack("crun").await.unwrap();
        let stack = sim.describe_stack("crun").await.unwrap();
        let cluster = stack.output("ClusterName").unwrap().to_string();
        let log_group = stack.output("LogGroupARN").unwrap().to_string();

        sim.push_script(script);
        let response = sim
            .run_task(RunTaskRequest {
                cluster,
                task_definition: "td".into(),
                count: 1,
                launch_type: LaunchType::Fargate,
                started_by: "test".into(),
                network: AwsVpcConfig {
                    subnets: vec![],
                    security_groups: vec![],
                    assign_public_ip: true,
                },
                overrides: vec![ContainerOverride {
                    name: "main".into(),
                    command: vec![],
                    environment: vec![],
                }],
                tags: vec![],
                propagate_task_definition_tags: true,
            })
            .await
            .unwrap();
        let task_id = response.tasks[0].task_arn.rsplit('/').next().unwrap().to_string();
        (log_group, format!("crun/main/{}", task_id))
    }

    #[test]
    fn test_group_name() {
        assert_eq!(group_name("g"), "g");
        assert_eq!(
            group_name("arn:aws:logs:sim:1:log-group:crun-LogGroup-X:*"),
            "crun-LogGroup-X"
        );
    }

    #[tokio::test]
    async fn test_live_tail_waits_for_stream_and_skips_history() {
        let sim = SimCloud::new("sim");
        let script = TaskScript::new(["a", "b", "c", "d"])
            .with_log_delay(Duration::from_millis(40))
            .with_line_interval(Duration::from_millis(30));
        let (group, stream) = launch(&sim, script).await;
        let request = LiveTailRequest {
            log_group: group.clone(),
            log_streams: vec![stream.clone()],
        };

        let err = sim.start_live_tail(request.clone()).await.unwrap_err();
        assert!(err.is_not_found());

        // "a" (40ms) and "b" (70ms) are history by now
        tokio::time::sleep(Duration::from_millis(85)).await;
        let mut live = sim.start_live_tail(request).await.unwrap();
        assert_eq!(sim.open_tails(), 1);

        let mut messages = Vec::new();
        while messages.len() < 2 {
            let item = live.recv().await.unwrap().unwrap();
            messages.extend(item.into_events().into_iter().map(|e| e.message));
        }
        assert_eq!(messages, ["c", "d"]);

        live.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(sim.open_tails(), 0);
    }

    #[tokio::test]
    async fn test_filter_log_events_paginates() {
        let sim = SimCloud::new("sim");
        let script = TaskScript::new(["a", "b", "c"])
            .with_log_delay(Duration::from_millis(5))
            .with_line_interval(Duration::from_millis(5));
        let (group, stream) = launch(&sim, script).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let mut request = FilterLogEventsRequest {
            log_group: group,
            log_streams: vec![stream.clone()],
            start_time: None,
            end_time: None,
            limit: Some(2),
            next_token: None,
        };
        let first = sim.filter_log_events(request.clone()).await.unwrap();
        assert_eq!(first.events.len(), 2);
        assert_eq!(first.events[0].event_id.as_deref(), Some(format!("{}:0", stream).as_str()));

        request.next_token = first.next_token;
        let second = sim.filter_log_events(request).await.unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].message, "c");
        assert!(second.next_token.is_none());

        let missing = sim
            .filter_log_events(FilterLogEventsRequest {
                log_group: "nope".into(),
                log_streams: vec![],
                start_time: None,
                end_time: None,
                limit: None,
                next_token: None,
            })
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }
}
