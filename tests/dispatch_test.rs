use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use r_dispatch::Error;
use r_dispatch::config::DispatchConfig;
use r_dispatch::error::TaskError;
use r_dispatch::queue::{InMemoryQueue, QueueStats, WorkQueue};
use r_dispatch::tasks::{
    DeploymentInfo, FileRef, InMemoryTaskStore, State, Task, TaskStore, TaskType,
};
use r_dispatch::worker::{Dispatcher, HandlerRegistry, TaskHandler, TaskOutcome};
use serde_json::Map;

fn fast_config(max: usize) -> DispatchConfig {
    DispatchConfig {
        max_concurrent_tasks: max,
        claim_timeout: Duration::from_millis(20),
        idle_delay: Duration::from_millis(5),
        saturated_delay: Duration::from_millis(5),
        error_backoff: Duration::from_millis(20),
    }
}

/// Sleeps, then reports an output file. Tracks peak concurrency.
#[derive(Default)]
struct SlowHandler {
    running: AtomicUsize,
    peak: AtomicUsize,
    handled: AtomicUsize,
}

#[async_trait]
impl TaskHandler for SlowHandler {
    async fn handle(&self, task: &Task) -> Result<TaskOutcome, Error> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.handled.fetch_add(1, Ordering::SeqCst);
        Ok(TaskOutcome {
            output_file: Some(FileRef {
                filename: format!("{}_converted.jpg", task.id),
                ..Default::default()
            }),
            deployment: None,
        })
    }
}

struct FailingHandler;

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn handle(&self, task: &Task) -> Result<TaskOutcome, Error> {
        Err(TaskError::MissingInput {
            id: task.id.clone(),
        }
        .into())
    }
}

struct PanickingHandler;

#[async_trait]
impl TaskHandler for PanickingHandler {
    async fn handle(&self, _task: &Task) -> Result<TaskOutcome, Error> {
        panic!("handler blew up");
    }
}

struct DeployingHandler;

#[async_trait]
impl TaskHandler for DeployingHandler {
    async fn handle(&self, _task: &Task) -> Result<TaskOutcome, Error> {
        Ok(TaskOutcome {
            output_file: None,
            deployment: Some(DeploymentInfo {
                repo_url: "https://github.com/acme/app".into(),
                port: Some(3000),
                is_running: true,
                ..Default::default()
            }),
        })
    }
}

struct Harness {
    queue: Arc<InMemoryQueue>,
    store: Arc<InMemoryTaskStore>,
    dispatcher: Arc<Dispatcher>,
    handle: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(handlers: HandlerRegistry, config: DispatchConfig) -> Self {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(InMemoryTaskStore::new());
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            store.clone(),
            Arc::new(handlers),
            config,
        ));
        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run().await }
        });
        Self {
            queue,
            store,
            dispatcher,
            handle,
        }
    }

    async fn submit(&self, task_type: TaskType) -> String {
        let task = Task::new(task_type, Map::new());
        self.store.insert(&task).await.unwrap();
        self.queue.enqueue(&task).await.unwrap();
        task.id
    }

    async fn wait_for(&self, id: &str, status: State) -> Task {
        for _ in 0..500 {
            let task = self.store.find_one(id).await.unwrap().unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never reached {status}");
    }

    async fn shutdown(self) {
        self.dispatcher.stop();
        self.handle.await.unwrap();
    }
}

#[tokio::test]
async fn never_exceeds_the_concurrency_cap() {
    let slow = Arc::new(SlowHandler::default());
    let mut handlers = HandlerRegistry::new();
    handlers.register(TaskType::ImageConvert, slow.clone());
    let harness = Harness::start(handlers, fast_config(3));

    let mut ids = Vec::new();
    for _ in 0..10 {
        ids.push(harness.submit(TaskType::ImageConvert).await);
    }
    for id in &ids {
        let task = harness.wait_for(id, State::Completed).await;
        assert!(task.output_file.is_some());
        assert!(task.processing_time_ms.is_some());
    }

    assert_eq!(slow.handled.load(Ordering::SeqCst), 10);
    assert!(slow.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(harness.queue.stats().await.unwrap(), QueueStats::default());
    harness.shutdown().await;
}

#[tokio::test]
async fn completed_tasks_pass_through_processing() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(TaskType::CsvAnalyze, Arc::new(SlowHandler::default()));
    let harness = Harness::start(handlers, fast_config(2));

    let id = harness.submit(TaskType::CsvAnalyze).await;
    let task = harness.wait_for(&id, State::Completed).await;
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_some());
    assert_eq!(
        harness.store.status_history(&id).await,
        vec![State::Pending, State::Processing, State::Completed]
    );
    harness.shutdown().await;
}

#[tokio::test]
async fn handler_errors_fail_the_task_and_are_acknowledged() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(TaskType::VideoTrim, Arc::new(FailingHandler));
    let harness = Harness::start(handlers, fast_config(2));

    let id = harness.submit(TaskType::VideoTrim).await;
    let task = harness.wait_for(&id, State::Failed).await;
    assert!(task.error.unwrap().contains("has no input file"));
    assert_eq!(harness.queue.stats().await.unwrap(), QueueStats::default());
    harness.shutdown().await;
}

#[tokio::test]
async fn panics_are_contained_and_the_loop_keeps_going() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(TaskType::PdfExtract, Arc::new(PanickingHandler));
    handlers.register(TaskType::CsvAnalyze, Arc::new(SlowHandler::default()));
    let harness = Harness::start(handlers, fast_config(1));

    let bad = harness.submit(TaskType::PdfExtract).await;
    let good = harness.submit(TaskType::CsvAnalyze).await;

    let failed = harness.wait_for(&bad, State::Failed).await;
    assert!(failed.error.unwrap().contains("panicked"));
    harness.wait_for(&good, State::Completed).await;
    assert_eq!(harness.dispatcher.active_count(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn unknown_types_fail_without_a_handler() {
    let harness = Harness::start(HandlerRegistry::new(), fast_config(1));

    let id = harness.submit(TaskType::ImageConvert).await;
    let task = harness.wait_for(&id, State::Failed).await;
    assert!(task.error.unwrap().contains("No handler registered"));
    harness.shutdown().await;
}

#[tokio::test]
async fn deployments_end_in_running() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(TaskType::GithubDeploy, Arc::new(DeployingHandler));
    let harness = Harness::start(handlers, fast_config(1));

    let id = harness.submit(TaskType::GithubDeploy).await;
    let task = harness.wait_for(&id, State::Running).await;
    let info = task.deployment_info.unwrap();
    assert!(info.is_running);
    assert_eq!(info.port, Some(3000));
    assert!(task.completed_at.is_none());
    harness.shutdown().await;
}

#[tokio::test]
async fn stop_waits_for_in_flight_units() {
    let slow = Arc::new(SlowHandler::default());
    let mut handlers = HandlerRegistry::new();
    handlers.register(TaskType::ImageConvert, slow.clone());
    let harness = Harness::start(handlers, fast_config(2));

    let first = harness.submit(TaskType::ImageConvert).await;
    harness.wait_for(&first, State::Processing).await;
    assert!(!harness.dispatcher.is_stopping());

    let store = harness.store.clone();
    harness.shutdown().await;

    let task = store.find_one(&first).await.unwrap().unwrap();
    assert_eq!(task.status, State::Completed);
    assert_eq!(slow.running.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stopped_dispatcher_claims_nothing_more() {
    let harness = Harness::start(HandlerRegistry::new(), fast_config(1));
    let queue = harness.queue.clone();
    harness.shutdown().await;

    let task = Task::new(TaskType::ImageConvert, Map::new());
    queue.enqueue(&task).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(queue.stats().await.unwrap().pending, 1);
}
