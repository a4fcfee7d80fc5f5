use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use cron_dispatch::scheduler::Scheduler;
use cron_dispatch::shutdown::{
    DrainPlan, DrainStep, FrontEnd, ProcessSignal, ShutdownError, ShutdownOrchestrator,
    ShutdownOutcome, ShutdownState,
};
use cron_dispatch::store::{
    FieldMap, NewTaskLog, StoreError, TaskLog, TaskLogStatus, TaskLogStore,
};

type Journal = Arc<Mutex<Vec<&'static str>>>;

#[derive(Clone, Copy)]
enum Behaviour {
    Ok,
    Fail,
    Hang,
}

struct StubFrontEnd {
    journal: Journal,
    behaviour: Behaviour,
}

#[async_trait]
impl FrontEnd for StubFrontEnd {
    async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.journal.lock().unwrap().push("http");
        match self.behaviour {
            Behaviour::Ok => Ok(()),
            Behaviour::Fail => Err(ShutdownError::Io(std::io::Error::other("listener broke"))),
            Behaviour::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}

struct StubScheduler {
    journal: Journal,
}

#[async_trait]
impl Scheduler for StubScheduler {
    fn initialize(&self) {}

    async fn wait_and_exit(&self) {
        self.journal.lock().unwrap().push("scheduler");
    }
}

struct StubStore {
    journal: Journal,
}

#[async_trait]
impl TaskLogStore for StubStore {
    async fn create(&self, _log: NewTaskLog) -> Result<TaskLog, StoreError> {
        Err(StoreError::Closed)
    }

    async fn update(&self, _id: i64, _fields: FieldMap) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn update_if(
        &self,
        _id: i64,
        _expected: TaskLogStatus,
        _fields: FieldMap,
    ) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn get(&self, _id: i64) -> Result<Option<TaskLog>, StoreError> {
        Ok(None)
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.journal.lock().unwrap().push("storage");
        Ok(())
    }
}

fn plan(journal: &Journal, front_end: Behaviour) -> DrainPlan {
    DrainPlan {
        front_end: Arc::new(StubFrontEnd {
            journal: journal.clone(),
            behaviour: front_end,
        }),
        scheduler: Arc::new(StubScheduler {
            journal: journal.clone(),
        }),
        storage: Arc::new(StubStore {
            journal: journal.clone(),
        }),
    }
}

fn orchestrator(timeout: Duration) -> (Arc<ShutdownOrchestrator>, Arc<AtomicI32>) {
    let exit_code = Arc::new(AtomicI32::new(-1));
    let recorded = exit_code.clone();
    let orchestrator = ShutdownOrchestrator::new(timeout)
        .with_exit_hook(move |code| recorded.store(code, Ordering::SeqCst));
    (Arc::new(orchestrator), exit_code)
}

#[tokio::test]
async fn test_drain_runs_steps_in_order() {
    let journal = Journal::default();
    let (orchestrator, exit_code) = orchestrator(Duration::from_secs(30));
    let (tx, rx) = mpsc::unbounded_channel();

    tx.send(ProcessSignal::Terminate).unwrap();
    let outcome = orchestrator.run(rx, plan(&journal, Behaviour::Ok)).await;

    assert_eq!(outcome, ShutdownOutcome::Completed { failed: vec![] });
    assert_eq!(*journal.lock().unwrap(), vec!["http", "scheduler", "storage"]);
    assert_eq!(orchestrator.state(), ShutdownState::Stopped);
    assert_eq!(exit_code.load(Ordering::SeqCst), -1);
}

#[tokio::test]
async fn test_failed_step_does_not_stop_later_steps() {
    let journal = Journal::default();
    let (orchestrator, _) = orchestrator(Duration::from_secs(30));
    let (tx, rx) = mpsc::unbounded_channel();

    tx.send(ProcessSignal::Interrupt).unwrap();
    let outcome = orchestrator.run(rx, plan(&journal, Behaviour::Fail)).await;

    assert_eq!(
        outcome,
        ShutdownOutcome::Completed {
            failed: vec![DrainStep::FrontEnd]
        }
    );
    assert_eq!(*journal.lock().unwrap(), vec!["http", "scheduler", "storage"]);
}

#[tokio::test]
async fn test_drain_is_bounded_by_deadline() {
    let journal = Journal::default();
    let (orchestrator, _) = orchestrator(Duration::from_millis(200));
    let (tx, rx) = mpsc::unbounded_channel();

    tx.send(ProcessSignal::Terminate).unwrap();
    let start = Instant::now();
    let outcome = orchestrator.run(rx, plan(&journal, Behaviour::Hang)).await;

    assert!(start.elapsed() < Duration::from_secs(5));
    match outcome {
        ShutdownOutcome::Completed { failed } => assert!(failed.contains(&DrainStep::FrontEnd)),
        other => panic!("unexpected outcome: {other:?}"),
    }
    // Later steps still get their turn.
    assert_eq!(*journal.lock().unwrap(), vec!["http", "scheduler", "storage"]);
}

#[tokio::test]
async fn test_second_signal_forces_exit_while_step_blocked() {
    let journal = Journal::default();
    let (orchestrator, exit_code) = orchestrator(Duration::from_secs(30));
    let (tx, rx) = mpsc::unbounded_channel();

    let run = {
        let orchestrator = orchestrator.clone();
        let plan = plan(&journal, Behaviour::Hang);
        tokio::spawn(async move { orchestrator.run(rx, plan).await })
    };

    tx.send(ProcessSignal::Terminate).unwrap();
    let mut state = orchestrator.subscribe();
    state
        .wait_for(|s| *s == ShutdownState::Draining)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*journal.lock().unwrap(), vec!["http"]);

    tx.send(ProcessSignal::Terminate).unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("second signal did not short-circuit the drain")
        .unwrap();

    assert_eq!(outcome, ShutdownOutcome::Forced);
    assert_eq!(exit_code.load(Ordering::SeqCst), 1);
    assert_eq!(*journal.lock().unwrap(), vec!["http"]);
}

#[tokio::test]
async fn test_hangup_is_ignored() {
    let journal = Journal::default();
    let (orchestrator, exit_code) = orchestrator(Duration::from_secs(30));
    let (tx, rx) = mpsc::unbounded_channel();

    let run = {
        let orchestrator = orchestrator.clone();
        let plan = plan(&journal, Behaviour::Ok);
        tokio::spawn(async move { orchestrator.run(rx, plan).await })
    };

    tx.send(ProcessSignal::Hangup).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.state(), ShutdownState::Running);
    assert!(journal.lock().unwrap().is_empty());

    tx.send(ProcessSignal::Terminate).unwrap();
    let outcome = run.await.unwrap();
    assert_eq!(outcome, ShutdownOutcome::Completed { failed: vec![] });
    assert_eq!(exit_code.load(Ordering::SeqCst), -1);
}

#[tokio::test]
async fn test_initiate_drain_without_signal() {
    let journal = Journal::default();
    let (orchestrator, _) = orchestrator(Duration::from_secs(30));
    let (_tx, rx) = mpsc::unbounded_channel();

    let run = {
        let orchestrator = orchestrator.clone();
        let plan = plan(&journal, Behaviour::Ok);
        tokio::spawn(async move { orchestrator.run(rx, plan).await })
    };

    assert!(orchestrator.initiate_drain());
    let outcome = run.await.unwrap();

    assert_eq!(outcome, ShutdownOutcome::Completed { failed: vec![] });
    assert!(!orchestrator.initiate_drain());
    assert_eq!(orchestrator.state(), ShutdownState::Stopped);
}
