//! 任务分发器：有界队列 + 固定 worker 池 + 限时结果认领
//!
//! submit 在队列满时快速失败（背压信号，不阻塞）；await_result 协作式等待且必有超时，
//! 每个结果恰好被认领一次；shutdown 先限时排空再强制取消，取消后的迟到结果一律丢弃。
//! 队列与结果表是仅有的跨任务共享可变状态，锁都收在本模块内部。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::CoreError;
use crate::dispatch::queue::BoundedPriorityQueue;
use crate::dispatch::{Job, JobId, JobResult, JobRunner};

/// 结果槽：等待中或已就绪；认领即从表中移除
enum ResultSlot {
    /// 尚未完成；唯一等待者挂在 Notify 上
    Pending(Arc<Notify>),
    Ready(JobResult),
}

/// 运行统计快照
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatcherStats {
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
}

struct Inner {
    queue: Mutex<BoundedPriorityQueue>,
    queue_notify: Notify,
    results: Mutex<HashMap<JobId, ResultSlot>>,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    /// 每完成一个任务通知一次，shutdown 的排空等待据此推进
    drained: Notify,
    cancel: CancellationToken,
    runner: Arc<dyn JobRunner>,
}

impl Inner {
    /// 写入结果并唤醒等待者；槽位已被清理（shutdown 之后）时丢弃
    fn publish(&self, result: JobResult) {
        if self.cancel.is_cancelled() {
            tracing::debug!("Discarding result for {} after cancellation", result.job_id);
            return;
        }
        let mut results = self.results.lock().expect("result table lock poisoned");
        match results.remove(&result.job_id) {
            Some(ResultSlot::Pending(notify)) => {
                results.insert(result.job_id, ResultSlot::Ready(result));
                notify.notify_one();
            }
            Some(ready @ ResultSlot::Ready(_)) => {
                // 同一 id 不会有第二个产出；保守起见保留先到的结果
                results.insert(result.job_id, ready);
            }
            None => {
                tracing::debug!("Discarding late result for {}", result.job_id);
            }
        }
    }

    fn pending_work(&self) -> usize {
        let queued = self.queue.lock().expect("queue lock poisoned").len();
        queued + self.in_flight.load(Ordering::SeqCst)
    }
}

/// 任务分发器
pub struct TaskDispatcher {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskDispatcher {
    /// 创建分发器并启动 worker 池
    pub fn new(queue_capacity: usize, worker_count: usize, runner: Arc<dyn JobRunner>) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BoundedPriorityQueue::new(queue_capacity)),
            queue_notify: Notify::new(),
            results: Mutex::new(HashMap::new()),
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            drained: Notify::new(),
            cancel: CancellationToken::new(),
            runner,
        });

        let worker_count = worker_count.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let inner = Arc::clone(&inner);
            workers.push(tokio::spawn(worker_loop(idx, inner)));
        }
        tracing::info!(
            "Dispatcher started: {} workers, queue capacity {}",
            worker_count,
            queue_capacity.max(1)
        );

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// 提交任务；队列满返回 QueueFull，关闭后返回 ShuttingDown
    pub fn submit(&self, job: Job) -> Result<JobId, CoreError> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(CoreError::ShuttingDown);
        }
        let job_id = job.id;

        // 先占结果槽再入队：避免 worker 在槽位出现前就完成任务
        self.inner
            .results
            .lock()
            .expect("result table lock poisoned")
            .insert(job_id, ResultSlot::Pending(Arc::new(Notify::new())));

        let enqueued = self
            .inner
            .queue
            .lock()
            .expect("queue lock poisoned")
            .push(job);
        if enqueued.is_err() {
            self.inner
                .results
                .lock()
                .expect("result table lock poisoned")
                .remove(&job_id);
            return Err(CoreError::QueueFull);
        }

        self.inner.queue_notify.notify_one();
        Ok(job_id)
    }

    /// 限时等待并认领结果
    ///
    /// 超时返回 ResultTimeout（任务继续运行，之后仍可认领一次）；
    /// 已认领或未知的 id 返回 ResultNotFound。
    pub async fn await_result(
        &self,
        job_id: JobId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JobResult, CoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = {
                let mut results = self.inner.results.lock().expect("result table lock poisoned");
                match results.remove(&job_id) {
                    None => return Err(CoreError::ResultNotFound(job_id)),
                    Some(ResultSlot::Ready(result)) => return Ok(result),
                    Some(ResultSlot::Pending(notify)) => {
                        let waiter = Arc::clone(&notify);
                        results.insert(job_id, ResultSlot::Pending(notify));
                        waiter
                    }
                }
            };

            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Err(CoreError::ResultTimeout),
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                _ = self.inner.cancel.cancelled() => return Err(CoreError::ShuttingDown),
            }
        }
    }

    /// 关闭：立即停止接收，限时排空队列与在途任务，然后强制取消
    ///
    /// 取消后不会再有任何结果写入结果表；未开始的任务被丢弃。
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        tracing::info!("Dispatcher shutting down, draining up to {:?}", drain_timeout);

        let drain = async {
            loop {
                if self.inner.pending_work() == 0 {
                    break;
                }
                tokio::select! {
                    _ = self.inner.drained.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        };

        if tokio::time::timeout(drain_timeout, drain).await.is_ok() {
            tracing::info!("Dispatcher drained cleanly");
        } else {
            tracing::warn!(
                "Drain timed out with {} jobs unfinished, force-cancelling",
                self.inner.pending_work()
            );
        }

        self.inner.cancel.cancel();
        self.inner.queue.lock().expect("queue lock poisoned").clear();
        self.inner
            .results
            .lock()
            .expect("result table lock poisoned")
            .clear();

        let workers = {
            let mut guard = self.workers.lock().expect("worker handles lock poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in workers {
            let _ = handle.await;
        }
        tracing::info!("Dispatcher stopped");
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queued: self.inner.queue.lock().expect("queue lock poisoned").len(),
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            completed: self.inner.completed.load(Ordering::SeqCst),
        }
    }
}

/// worker 主循环：先清空队列，再挂起等待新任务或取消
async fn worker_loop(worker_idx: usize, inner: Arc<Inner>) {
    loop {
        if inner.cancel.is_cancelled() {
            break;
        }

        let job = inner.queue.lock().expect("queue lock poisoned").pop();
        let Some(job) = job else {
            tokio::select! {
                _ = inner.cancel.cancelled() => break,
                _ = inner.queue_notify.notified() => {}
            }
            continue;
        };

        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let job_id = job.id;
        let kind = job.kind;
        let job_cancel = inner.cancel.child_token();
        let started = std::time::Instant::now();

        // panic 在此边界折叠为 Err，绝不带垮 worker 池；
        // 强制取消时直接放弃任务体，部分结果不进入结果表
        let run = AssertUnwindSafe(inner.runner.run(&job, &job_cancel)).catch_unwind();
        let payload = tokio::select! {
            outcome = run => match outcome {
                Ok(Ok(out)) => Ok(out),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(format!("worker {} recovered from panic in {:?} job", worker_idx, kind)),
            },
            _ = job_cancel.cancelled() => Err("job cancelled during shutdown".to_string()),
        };

        let audit = serde_json::json!({
            "event": "job_audit",
            "job_id": job_id.to_string(),
            "kind": format!("{:?}", kind),
            "ok": payload.is_ok(),
            "duration_ms": started.elapsed().as_millis() as u64,
        });
        tracing::debug!(audit = %audit.to_string(), "job");

        inner.publish(JobResult { job_id, payload });
        inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        inner.completed.fetch_add(1, Ordering::SeqCst);
        inner.drained.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{JobOutcome, JobPayload};
    use async_trait::async_trait;

    /// 测试执行器：回显键、可选延迟、记录执行顺序，`boom` 键触发 panic
    struct TestRunner {
        delay: Option<Duration>,
        order: Mutex<Vec<String>>,
    }

    impl TestRunner {
        fn new() -> Self {
            Self {
                delay: None,
                order: Mutex::new(Vec::new()),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                order: Mutex::new(Vec::new()),
            }
        }

        fn order(&self) -> Vec<String> {
            self.order.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl JobRunner for TestRunner {
        async fn run(&self, job: &Job, cancel: &CancellationToken) -> Result<JobOutcome, String> {
            let key = match &job.payload {
                JobPayload::LookupKnowledge { keys } => keys[0].clone(),
                _ => "other".to_string(),
            };
            if key == "boom" {
                panic!("collaborator exploded");
            }
            if key == "fail" {
                return Err("collaborator error".to_string());
            }
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err("cancelled".to_string()),
                }
            }
            self.order.lock().unwrap().push(key.clone());
            Ok(JobOutcome::Snippets(vec![key]))
        }
    }

    fn lookup_job(key: &str) -> Job {
        Job::new(JobPayload::LookupKnowledge {
            keys: vec![key.to_string()],
        })
    }

    fn snippet_of(result: &JobResult) -> String {
        match result.payload.as_ref().unwrap() {
            JobOutcome::Snippets(s) => s[0].clone(),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_and_await() {
        let dispatcher = TaskDispatcher::new(8, 2, Arc::new(TestRunner::new()));
        let cancel = CancellationToken::new();

        let id = dispatcher.submit(lookup_job("hello")).unwrap();
        let result = dispatcher
            .await_result(id, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(snippet_of(&result), "hello");
    }

    #[tokio::test]
    async fn test_result_claimed_at_most_once() {
        let dispatcher = TaskDispatcher::new(8, 1, Arc::new(TestRunner::new()));
        let cancel = CancellationToken::new();

        let id = dispatcher.submit(lookup_job("once")).unwrap();
        dispatcher
            .await_result(id, Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        let second = dispatcher
            .await_result(id, Duration::from_millis(100), &cancel)
            .await;
        assert!(matches!(second, Err(CoreError::ResultNotFound(_))));
    }

    #[tokio::test]
    async fn test_queue_full_backpressure() {
        // 单 worker 被慢任务占住，容量 1 的队列放下一个后即满
        let dispatcher = TaskDispatcher::new(1, 1, Arc::new(TestRunner::slow(Duration::from_secs(30))));

        let first = dispatcher.submit(lookup_job("occupies-worker"));
        assert!(first.is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = dispatcher.submit(lookup_job("queued"));
        assert!(second.is_ok());
        let third = dispatcher.submit(lookup_job("rejected"));
        assert!(matches!(third, Err(CoreError::QueueFull)));

        // 已接收的任务仍然在队列里
        assert_eq!(dispatcher.stats().queued, 1);
        dispatcher.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_timeout_then_later_claim() {
        let dispatcher =
            TaskDispatcher::new(8, 1, Arc::new(TestRunner::slow(Duration::from_millis(150))));
        let cancel = CancellationToken::new();

        let id = dispatcher.submit(lookup_job("slowpoke")).unwrap();
        let early = dispatcher
            .await_result(id, Duration::from_millis(20), &cancel)
            .await;
        assert!(matches!(early, Err(CoreError::ResultTimeout)));

        // 任务仍在运行，稍后仍可恰好认领一次
        let late = dispatcher
            .await_result(id, Duration::from_secs(2), &cancel)
            .await
            .unwrap();
        assert_eq!(snippet_of(&late), "slowpoke");

        let again = dispatcher
            .await_result(id, Duration::from_millis(50), &cancel)
            .await;
        assert!(matches!(again, Err(CoreError::ResultNotFound(_))));
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_tiebreak() {
        // 单 worker 先被慢任务占住，其余任务按优先级（同级 FIFO）出队
        let runner = Arc::new(TestRunner::slow(Duration::from_millis(80)));
        let dispatcher = TaskDispatcher::new(8, 1, Arc::clone(&runner) as Arc<dyn JobRunner>);
        let cancel = CancellationToken::new();

        let blocker = dispatcher.submit(lookup_job("blocker")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let low = dispatcher.submit(lookup_job("low").with_priority(0)).unwrap();
        let high = dispatcher.submit(lookup_job("high").with_priority(5)).unwrap();
        let low2 = dispatcher.submit(lookup_job("low2").with_priority(0)).unwrap();

        for id in [blocker, low, high, low2] {
            dispatcher
                .await_result(id, Duration::from_secs(2), &cancel)
                .await
                .unwrap();
        }

        assert_eq!(runner.order(), vec!["blocker", "high", "low", "low2"]);
    }

    #[tokio::test]
    async fn test_worker_survives_panic() {
        let dispatcher = TaskDispatcher::new(8, 1, Arc::new(TestRunner::new()));
        let cancel = CancellationToken::new();

        let bad = dispatcher.submit(lookup_job("boom")).unwrap();
        let result = dispatcher
            .await_result(bad, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert!(result.payload.is_err());
        assert!(result.payload.unwrap_err().contains("panic"));

        // 同一个 worker 继续服务后续任务
        let good = dispatcher.submit(lookup_job("still-alive")).unwrap();
        let result = dispatcher
            .await_result(good, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(snippet_of(&result), "still-alive");
    }

    #[tokio::test]
    async fn test_collaborator_error_becomes_result_err() {
        let dispatcher = TaskDispatcher::new(8, 1, Arc::new(TestRunner::new()));
        let cancel = CancellationToken::new();

        let id = dispatcher.submit(lookup_job("fail")).unwrap();
        let result = dispatcher
            .await_result(id, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(result.payload.unwrap_err(), "collaborator error");
    }

    #[tokio::test]
    async fn test_shutdown_drains_completed_jobs() {
        let runner = Arc::new(TestRunner::new());
        let dispatcher = TaskDispatcher::new(16, 2, Arc::clone(&runner) as Arc<dyn JobRunner>);

        for i in 0..8 {
            dispatcher.submit(lookup_job(&format!("job{}", i))).unwrap();
        }
        dispatcher.shutdown(Duration::from_secs(2)).await;

        assert_eq!(dispatcher.stats().completed, 8);
        assert!(!dispatcher.is_accepting());
        assert!(matches!(
            dispatcher.submit(lookup_job("late")),
            Err(CoreError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_unfinished_jobs() {
        let runner = Arc::new(TestRunner::slow(Duration::from_secs(60)));
        let dispatcher = TaskDispatcher::new(16, 1, Arc::clone(&runner) as Arc<dyn JobRunner>);
        let cancel = CancellationToken::new();

        let id = dispatcher.submit(lookup_job("doomed")).unwrap();
        dispatcher.submit(lookup_job("never-started")).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        dispatcher.shutdown(Duration::from_millis(50)).await;

        // 结果表已清空，未开始的任务被丢弃；之后的等待不会拿到任何结果
        let gone = dispatcher
            .await_result(id, Duration::from_millis(50), &cancel)
            .await;
        assert!(gone.is_err());
        assert_eq!(dispatcher.stats().queued, 0);
        assert_eq!(runner.order().len(), 0);
    }
}
