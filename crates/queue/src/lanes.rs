//! Execution lanes.
//!
//! A lane drains an unbounded channel of jobs. Serial lanes run one job at
//! a time in channel order; parallel lanes spawn a task per job. Keyed lanes
//! are serial lanes created on first use for each community or group key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::job::QueuedJob;

/// Runs one job and reports its outcome.
///
/// Implementations must not propagate failures: a lane keeps draining no
/// matter how the previous job ended.
#[async_trait]
pub trait LaneRunner: Send + Sync {
    async fn run(&self, job: QueuedJob, lane: &'static str);
}

/// How a lane executes the jobs it dequeues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneMode {
    Serial,
    Parallel,
}

/// Spawn a lane worker draining `rx`.
///
/// The worker stops dequeuing once `cancel` fires. A job already running is
/// left to finish.
pub fn spawn_lane(
    name: &'static str,
    mode: LaneMode,
    mut rx: mpsc::UnboundedReceiver<QueuedJob>,
    runner: Arc<dyn LaneRunner>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(lane = name, ?mode, "Lane started");
        loop {
            let job = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            match mode {
                LaneMode::Serial => runner.run(job, name).await,
                LaneMode::Parallel => {
                    let runner = runner.clone();
                    tokio::spawn(async move { runner.run(job, name).await });
                }
            }
        }
        debug!(lane = name, "Lane stopped");
    })
}

/// Serial lanes keyed by community or group.
///
/// Lanes live for the rest of the process once created.
pub struct KeyedLanes {
    lanes: RwLock<HashMap<String, mpsc::UnboundedSender<QueuedJob>>>,
    runner: Arc<dyn LaneRunner>,
    cancel: CancellationToken,
}

impl KeyedLanes {
    #[must_use]
    pub fn new(runner: Arc<dyn LaneRunner>, cancel: CancellationToken) -> Self {
        Self {
            lanes: RwLock::new(HashMap::new()),
            runner,
            cancel,
        }
    }

    /// Queue `job` on the lane for `key`, creating the lane if needed.
    ///
    /// Returns the job back if the lane has stopped.
    pub async fn dispatch(&self, key: &str, job: QueuedJob) -> Result<(), QueuedJob> {
        // Fast path: lane already exists.
        if let Some(tx) = self.lanes.read().await.get(key) {
            return tx.send(job).map_err(|e| e.0);
        }

        let mut lanes = self.lanes.write().await;
        let tx = lanes.entry(key.to_string()).or_insert_with(|| {
            info!(key, "Creating community lane");
            let (tx, rx) = mpsc::unbounded_channel();
            spawn_lane(
                "community",
                LaneMode::Serial,
                rx,
                self.runner.clone(),
                self.cancel.clone(),
            );
            tx
        });
        tx.send(job).map_err(|e| e.0)
    }

    /// Number of lanes created so far.
    pub async fn len(&self) -> usize {
        self.lanes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.lanes.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use courier_common::{AppResult, JobId};

    use super::*;
    use crate::job::{Job, JobContext, JobError, Lane};

    #[derive(Debug)]
    struct Noop;

    #[async_trait]
    impl Job for Noop {
        fn factory_key(&self) -> &'static str {
            "Noop"
        }
        fn max_failure_count(&self) -> u32 {
            1
        }
        fn lane(&self) -> Lane {
            Lane::Receive
        }
        fn serialize(&self) -> AppResult<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            Ok(())
        }
    }

    /// Records start and end of each run; sleeps longer for earlier jobs.
    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LaneRunner for Recorder {
        async fn run(&self, job: QueuedJob, _lane: &'static str) {
            let seq = job.id.sequence();
            self.log.lock().unwrap().push(format!("start {seq}"));
            tokio::time::sleep(Duration::from_millis(u64::from(30 - seq * 10))).await;
            self.log.lock().unwrap().push(format!("end {seq}"));
        }
    }

    fn queued(seq: u32) -> QueuedJob {
        QueuedJob::new(JobId::new(1, seq), 0, Arc::new(Noop))
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_lane_runs_in_order() {
        let recorder = Arc::new(Recorder::default());
        let lanes = KeyedLanes::new(recorder.clone(), CancellationToken::new());

        for seq in 0..3 {
            lanes.dispatch("server.room", queued(seq)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(
            *recorder.log.lock().unwrap(),
            vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
        assert_eq!(lanes.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_get_distinct_lanes() {
        let recorder = Arc::new(Recorder::default());
        let lanes = KeyedLanes::new(recorder.clone(), CancellationToken::new());

        lanes.dispatch("a.room", queued(0)).await.unwrap();
        lanes.dispatch("b.room", queued(1)).await.unwrap();
        lanes.dispatch("a.room", queued(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(lanes.len().await, 2);
        let log = recorder.log.lock().unwrap();
        // The "b" lane does not wait for the "a" lane.
        let b_start = log.iter().position(|l| l == "start 1").unwrap();
        let a_end = log.iter().position(|l| l == "end 0").unwrap();
        assert!(b_start < a_end);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_lane_overlaps_jobs() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_lane(
            "tx",
            LaneMode::Parallel,
            rx,
            recorder.clone(),
            CancellationToken::new(),
        );

        tx.send(queued(0)).unwrap();
        tx.send(queued(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let log = recorder.log.lock().unwrap();
        assert_eq!(&log[..2], ["start 0", "start 1"]);
    }

    #[tokio::test]
    async fn test_canceled_lane_stops_dequeuing() {
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        cancel.cancel();
        let handle = spawn_lane("rx", LaneMode::Serial, rx, recorder.clone(), cancel);

        let _ = tx.send(queued(0));
        handle.await.unwrap();

        assert!(recorder.log.lock().unwrap().is_empty());
    }
}
