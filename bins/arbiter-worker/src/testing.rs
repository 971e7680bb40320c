//! In-process stand-ins for Redis, Docker and the grading backend.

use crate::engine::{ContainerPlatform, LogChunk, LogStream, StdStream};
use crate::executor::ExecutionRequest;
use anyhow::{anyhow, bail, Result};
use arbiter_common::{
    CoordinationStore, GradingBackend, SolutionDetails, SolutionInfo, SolutionPoll, SolutionRef,
};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Coordination store over a mutex-guarded map. Every operation holds the
/// lock for its whole duration, matching Redis' per-command atomicity.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    fn int(data: &HashMap<String, String>, key: &str) -> i64 {
        data.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_if_exists(&self, key: &str, value: &str) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        match data.get_mut(key) {
            Some(existing) => {
                *existing = value.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.data.lock().unwrap().remove(key).is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        if data.get(key).map(String::as_str) == Some(expected) {
            data.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn increment_bounded(
        &self,
        counter_key: &str,
        limit_key: &str,
        holder: Option<(&str, &str)>,
    ) -> Result<bool> {
        let mut data = self.data.lock().unwrap();
        let used = Self::int(&data, counter_key);
        if used < Self::int(&data, limit_key) {
            data.insert(counter_key.to_string(), (used + 1).to_string());
            if let Some((key, value)) = holder {
                data.insert(key.to_string(), value.to_string());
            }
            return Ok(true);
        }
        Ok(false)
    }

    async fn decrement_floored(&self, counter_key: &str) -> Result<i64> {
        let mut data = self.data.lock().unwrap();
        let used = (Self::int(&data, counter_key) - 1).max(0);
        data.insert(counter_key.to_string(), used.to_string());
        Ok(used)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.lock().unwrap();
        let mut keys: Vec<String> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// What a scripted container does once started
#[derive(Debug, Clone, Default)]
pub struct ContainerScript {
    pub chunks: Vec<LogChunk>,
    /// Virtual time before each chunk is written
    pub line_delay: Duration,
    pub exit_code: i64,
    /// Run (virtual) time before the container exits on its own
    pub exit_delay: Duration,
    /// Never exit until stopped
    pub hang: bool,
    pub oom: bool,
    pub fail_create: bool,
    pub fail_start: bool,
    pub fail_wait: bool,
}

impl ContainerScript {
    /// Container that prints `lines` on stdout and exits 0
    pub fn stdout(lines: &[&str]) -> Self {
        Self {
            chunks: lines
                .iter()
                .map(|line| LogChunk {
                    stream: StdStream::Stdout,
                    bytes: format!("{}\n", line).into_bytes(),
                })
                .collect(),
            ..Self::default()
        }
    }
}

pub struct ScriptedPlatform {
    script: ContainerScript,
    stopped: AtomicBool,
    stop_signal: Notify,
    created: Mutex<Vec<ExecutionRequest>>,
    stop_calls: AtomicUsize,
    remove_calls: AtomicUsize,
}

impl ScriptedPlatform {
    pub fn new(script: ContainerScript) -> Self {
        Self {
            script,
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
            created: Mutex::new(Vec::new()),
            stop_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
        }
    }

    pub fn created(&self) -> Vec<ExecutionRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    fn output(&self, wanted: StdStream) -> String {
        self.script
            .chunks
            .iter()
            .filter(|chunk| chunk.stream == wanted)
            .map(|chunk| String::from_utf8_lossy(&chunk.bytes).into_owned())
            .collect()
    }
}

#[async_trait]
impl ContainerPlatform for ScriptedPlatform {
    async fn create(&self, request: &ExecutionRequest) -> Result<String> {
        if self.script.fail_create {
            bail!("no such image: {}", request.image);
        }
        self.created.lock().unwrap().push(request.clone());
        Ok(format!("container-{}", self.created.lock().unwrap().len()))
    }

    async fn start(&self, _id: &str) -> Result<()> {
        if self.script.fail_start {
            bail!("cannot start container");
        }
        Ok(())
    }

    async fn wait(&self, _id: &str) -> Result<i64> {
        if self.script.fail_wait {
            bail!("connection reset");
        }
        if self.script.hang {
            while !self.stopped.load(Ordering::SeqCst) {
                self.stop_signal.notified().await;
            }
            return Ok(137);
        }
        tokio::time::sleep(self.script.exit_delay).await;
        Ok(self.script.exit_code)
    }

    async fn stop(&self, _id: &str) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_signal.notify_one();
        Ok(())
    }

    async fn oom_killed(&self, _id: &str) -> Result<bool> {
        Ok(self.script.oom)
    }

    fn follow_logs(&self, _id: &str) -> LogStream {
        let chunks = self.script.chunks.clone();
        let delay = self.script.line_delay;
        if delay.is_zero() {
            return stream::iter(chunks.into_iter().map(Ok)).boxed();
        }
        stream::iter(chunks)
            .then(move |chunk| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, anyhow::Error>(chunk)
            })
            .boxed()
    }

    async fn logs(&self, _id: &str) -> Result<(String, String)> {
        Ok((self.output(StdStream::Stdout), self.output(StdStream::Stderr)))
    }

    async fn remove(&self, _id: &str) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Patch(SolutionRef, SolutionInfo),
    Detail(SolutionRef, SolutionDetails),
    Complete(SolutionRef),
}

/// Backend that hands out queued polls and records every report
#[derive(Default)]
pub struct RecordingBackend {
    queue: Mutex<VecDeque<SolutionPoll>>,
    calls: Mutex<Vec<BackendCall>>,
    pub fail_polls: AtomicBool,
    pub fail_reports: AtomicBool,
}

impl RecordingBackend {
    pub fn enqueue(&self, poll: SolutionPoll) {
        self.queue.lock().unwrap().push_back(poll);
    }

    /// Polls not yet handed out
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: BackendCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail_reports.load(Ordering::SeqCst) {
            return Err(anyhow!("backend unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl GradingBackend for RecordingBackend {
    async fn poll(&self) -> Result<Option<SolutionPoll>> {
        if self.fail_polls.load(Ordering::SeqCst) {
            bail!("connection refused");
        }
        Ok(self.queue.lock().unwrap().pop_front())
    }

    async fn patch(&self, solution: &SolutionRef, info: &SolutionInfo) -> Result<()> {
        self.record(BackendCall::Patch(solution.clone(), info.clone()))
    }

    async fn save_detail(&self, solution: &SolutionRef, details: &SolutionDetails) -> Result<()> {
        self.record(BackendCall::Detail(solution.clone(), details.clone()))
    }

    async fn complete(&self, solution: &SolutionRef) -> Result<()> {
        self.record(BackendCall::Complete(solution.clone()))
    }
}

/// Poll descriptor for a task whose judge config is `config`
pub fn poll_with_config(solution_id: &str, config: serde_json::Value) -> SolutionPoll {
    let mut poll = SolutionPoll {
        task_id: format!("task-{}", solution_id),
        solution_id: solution_id.to_string(),
        user_id: "user-1".to_string(),
        problem_data_url: "https://data.example/problem.tar".to_string(),
        problem_data_hash: "p-hash".to_string(),
        solution_data_url: "https://data.example/solution.tar".to_string(),
        solution_data_hash: "s-hash".to_string(),
        ..SolutionPoll::default()
    };
    poll.problem_config.judge.config = config;
    poll
}
