//! Dispatch → queue → worker → batch counters, wired with in-memory backends

mod helpers;

use helpers::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use vayam::models::invite::{Backoff, InvitationJob, JobOptions, SEND_INVITE_JOB};
use vayam::models::batch::BatchStatus;
use vayam::services::batch_store::{BatchStore, MemoryBatchStore};
use vayam::services::dispatch::{DispatchError, InviteDispatcher};
use vayam::services::queue::{JobQueue, JobState, MemoryJobQueue};
use vayam::services::worker::{process_next_job, rate_limiter, InviteWorker, WorkerRuntime};

const PLATFORM_URL: &str = "https://vayam.app";

fn immediate_retries() -> JobOptions {
    JobOptions {
        backoff: Backoff::Fixed { delay_ms: 0 },
        ..JobOptions::default()
    }
}

struct Pipeline {
    directory: Arc<MemoryDirectory>,
    queue: Arc<MemoryJobQueue>,
    batches: Arc<MemoryBatchStore>,
    mailer: Arc<ScriptedMailer>,
    dispatcher: InviteDispatcher,
}

impl Pipeline {
    fn new(directory: MemoryDirectory, mailer: ScriptedMailer) -> Self {
        let directory = Arc::new(directory);
        let queue = Arc::new(MemoryJobQueue::new());
        let batches = Arc::new(MemoryBatchStore::new());
        let dispatcher = InviteDispatcher::new(
            directory.clone(),
            queue.clone(),
            batches.clone(),
            PLATFORM_URL,
        )
        .with_options(immediate_retries());

        Self {
            directory,
            queue,
            batches,
            mailer: Arc::new(mailer),
            dispatcher,
        }
    }

    fn worker(&self) -> InviteWorker {
        InviteWorker::new(self.batches.clone(), self.mailer.clone(), PLATFORM_URL)
    }

    /// Process jobs until nothing is waiting, delayed or in flight.
    async fn drain(&self) {
        let worker = self.worker();
        let limiter = rate_limiter(1000);
        for _ in 0..100 {
            if self.queue.is_drained() {
                return;
            }
            process_next_job(self.queue.as_ref(), &worker, &limiter)
                .await
                .unwrap();
        }
        panic!("queue did not drain");
    }
}

#[tokio::test]
async fn test_two_succeed_one_exhausts_retries() {
    let q = question("Water Policy");
    let question_id = q.id;
    let directory = MemoryDirectory::new(
        Some(q),
        vec![
            recipient("ana@example.org", "Ana"),
            recipient("ben@example.org", "Ben"),
            recipient("cy@example.org", "Cy"),
        ],
    );
    let pipeline = Pipeline::new(directory, ScriptedMailer::new().always_fail("cy@example.org"));

    let outcome = pipeline.dispatcher.dispatch_invites(question_id).await.unwrap();
    assert_eq!(outcome.queued, 3);
    let batch_id = outcome.batch_id.expect("batch created");

    pipeline.drain().await;

    let record = pipeline.batches.fetch(batch_id).await.unwrap().unwrap();
    assert_eq!(record.total, 3);
    assert_eq!(record.completed, 2);
    assert_eq!(record.failed, 1);
    assert_eq!(record.failed_emails, vec!["cy@example.org"]);

    let status = BatchStatus::from(record);
    assert_eq!(status.progress, 100);
    assert!(status.done);
    assert_eq!(status.pending, 0);

    assert_eq!(pipeline.mailer.attempts_for("cy@example.org"), 3);
    assert_eq!(pipeline.mailer.attempts_for("ana@example.org"), 1);
    assert_eq!(pipeline.queue.retained(), (2, 1));
}

#[tokio::test]
async fn test_transient_failure_is_retried_without_counting() {
    let q = question("Transit Budget");
    let question_id = q.id;
    let directory = MemoryDirectory::new(Some(q), vec![recipient("ana@example.org", "Ana")]);
    let pipeline = Pipeline::new(directory, ScriptedMailer::new().fail_times("ana@example.org", 2));

    let batch_id = pipeline
        .dispatcher
        .dispatch_invites(question_id)
        .await
        .unwrap()
        .batch_id
        .unwrap();

    let worker = pipeline.worker();
    let limiter = rate_limiter(1000);

    // First failed attempt leaves the counters untouched.
    process_next_job(pipeline.queue.as_ref(), &worker, &limiter).await.unwrap();
    let record = pipeline.batches.fetch(batch_id).await.unwrap().unwrap();
    assert_eq!((record.completed, record.failed), (0, 0));

    pipeline.drain().await;

    let record = pipeline.batches.fetch(batch_id).await.unwrap().unwrap();
    assert_eq!((record.completed, record.failed), (1, 0));
    assert!(record.failed_emails.is_empty());
    assert_eq!(pipeline.mailer.attempts_for("ana@example.org"), 3);
}

#[tokio::test]
async fn test_no_pending_recipients_creates_no_batch() {
    let q = question("Parks");
    let question_id = q.id;
    let pipeline = Pipeline::new(MemoryDirectory::new(Some(q), Vec::new()), ScriptedMailer::new());

    let outcome = pipeline.dispatcher.dispatch_invites(question_id).await.unwrap();
    assert_eq!(outcome.queued, 0);
    assert!(outcome.batch_id.is_none());
    assert!(pipeline.batches.is_empty());
    assert_eq!(pipeline.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn test_invalid_emails_are_not_counted() {
    let q = question("Housing");
    let question_id = q.id;
    let directory = MemoryDirectory::new(
        Some(q),
        vec![recipient("not-an-email", "Broken"), recipient("ana@example.org", "Ana")],
    );
    let pipeline = Pipeline::new(directory, ScriptedMailer::new());

    let outcome = pipeline.dispatcher.dispatch_invites(question_id).await.unwrap();
    assert_eq!(outcome.queued, 1);

    let record = pipeline.batches.fetch(outcome.batch_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(record.total, 1);
}

#[tokio::test]
async fn test_unknown_question() {
    let pipeline = Pipeline::new(MemoryDirectory::new(None, Vec::new()), ScriptedMailer::new());
    let err = pipeline.dispatcher.dispatch_invites(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, DispatchError::QuestionNotFound(_)));
}

#[tokio::test]
async fn test_job_of_crashed_worker_is_picked_up_again() {
    let q = question("Water Policy");
    let question_id = q.id;
    let directory = Arc::new(MemoryDirectory::new(
        Some(q),
        vec![recipient("ana@example.org", "Ana")],
    ));
    let queue = Arc::new(MemoryJobQueue::new().with_lease(Duration::from_millis(20)));
    let batches = Arc::new(MemoryBatchStore::new());
    let mailer = Arc::new(ScriptedMailer::new());
    let dispatcher = InviteDispatcher::new(directory, queue.clone(), batches.clone(), PLATFORM_URL);
    let batch_id = dispatcher
        .dispatch_invites(question_id)
        .await
        .unwrap()
        .batch_id
        .unwrap();

    // Claimed by a worker that never reports back.
    let lost = queue.claim().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    let worker = InviteWorker::new(batches.clone(), mailer.clone(), PLATFORM_URL);
    assert!(process_next_job(queue.as_ref(), &worker, &rate_limiter(10)).await.unwrap());

    assert_eq!(mailer.sent().len(), 1);
    assert!(queue.is_drained());
    assert_eq!(queue.job_state(lost.id), Some(JobState::Completed));
    let record = batches.fetch(batch_id).await.unwrap().unwrap();
    assert_eq!((record.completed, record.failed), (1, 0));
    assert!(record.is_done());
}

#[tokio::test]
async fn test_bad_platform_url_creates_nothing() {
    let q = question("Water Policy");
    let question_id = q.id;
    let directory = Arc::new(MemoryDirectory::new(
        Some(q),
        vec![recipient("ana@example.org", "Ana")],
    ));
    let queue = Arc::new(MemoryJobQueue::new());
    let batches = Arc::new(MemoryBatchStore::new());
    let dispatcher = InviteDispatcher::new(
        directory.clone(),
        queue.clone(),
        batches.clone(),
        "not a url",
    );

    let err = dispatcher.dispatch_invites(question_id).await.unwrap_err();
    assert!(matches!(err, DispatchError::InvalidPlatformUrl(_)));
    assert!(batches.is_empty());
    assert_eq!(queue.depth().await.unwrap(), 0);
    assert!(directory.invited().is_empty());
}

#[tokio::test]
async fn test_recipients_marked_sent_at_enqueue_time() {
    let q = question("Water Policy");
    let question_id = q.id;
    let ana = recipient("ana@example.org", "Ana");
    let ben = recipient("ben@example.org", "Ben");
    let expected = vec![ana.company_user_id, ben.company_user_id];
    let pipeline = Pipeline::new(
        MemoryDirectory::new(Some(q), vec![ana, ben]),
        ScriptedMailer::new().always_fail("ben@example.org"),
    );

    pipeline.dispatcher.dispatch_invites(question_id).await.unwrap();

    // Marked before any worker ran, and regardless of later delivery failure.
    assert_eq!(pipeline.directory.invited(), expected);
    pipeline.drain().await;
    assert_eq!(pipeline.directory.invited(), expected);
}

#[tokio::test]
async fn test_custom_subject_and_invite_link_reach_the_mailer() {
    let mut q = question("Water Policy");
    q.invite_subject = Some("{{name}}, help shape {{questionTitle}}".to_string());
    q.invite_body = Some("Sign up at {{inviteLink}}".to_string());
    let question_id = q.id;
    let pipeline = Pipeline::new(
        MemoryDirectory::new(Some(q), vec![recipient("ana@example.org", "Ana")]),
        ScriptedMailer::new(),
    );

    pipeline.dispatcher.dispatch_invites(question_id).await.unwrap();
    pipeline.drain().await;

    let sent = pipeline.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "ana@example.org");
    assert_eq!(sent[0].subject, "Ana, help shape Water Policy");
    assert_eq!(
        sent[0].html,
        "<p>Sign up at https://vayam.app/signup?email=ana%40example.org</p>"
    );
}

#[tokio::test]
async fn test_job_without_batch_is_sent() {
    let queue = Arc::new(MemoryJobQueue::new());
    let batches = Arc::new(MemoryBatchStore::new());
    let mailer = Arc::new(ScriptedMailer::new());
    let worker = InviteWorker::new(batches.clone(), mailer.clone(), PLATFORM_URL);

    let job = InvitationJob {
        to: "solo@example.org".to_string(),
        recipient_name: "Solo".to_string(),
        question_title: "Libraries".to_string(),
        question_id: Uuid::new_v4(),
        invite_link: format!("{}/signup?email=solo%40example.org", PLATFORM_URL),
        custom_subject: None,
        custom_body: None,
        batch_id: None,
    };
    queue.enqueue(SEND_INVITE_JOB, &job, &JobOptions::default()).await.unwrap();

    assert!(process_next_job(queue.as_ref(), &worker, &rate_limiter(10)).await.unwrap());
    assert_eq!(mailer.sent().len(), 1);
    assert!(queue.is_drained());
    assert!(batches.is_empty());
}

#[tokio::test]
async fn test_runtime_concurrent_consumers_lose_no_updates() {
    let q = question("Budget");
    let question_id = q.id;
    let recipients: Vec<_> = (0..15)
        .map(|i| recipient(&format!("user{}@example.org", i), &format!("User {}", i)))
        .collect();
    let pipeline = Pipeline::new(
        MemoryDirectory::new(Some(q), recipients),
        ScriptedMailer::new().always_fail("user7@example.org"),
    );

    let batch_id = pipeline
        .dispatcher
        .dispatch_invites(question_id)
        .await
        .unwrap()
        .batch_id
        .unwrap();

    let runtime = WorkerRuntime::new(
        pipeline.queue.clone(),
        pipeline.worker(),
        5,
        10,
        Duration::from_millis(5),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let started = Instant::now();
    let handle = tokio::spawn(runtime.run(shutdown_rx));

    let record = loop {
        let record = pipeline.batches.fetch(batch_id).await.unwrap().unwrap();
        assert!(record.finished() <= record.total);
        if record.is_done() {
            break record;
        }
        assert!(started.elapsed() < Duration::from_secs(20), "batch never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(record.completed, 14);
    assert_eq!(record.failed, 1);
    assert_eq!(record.failed_emails, vec!["user7@example.org"]);
    // 17 job starts at 10/s with a burst of 10 cannot finish instantly.
    assert!(started.elapsed() >= Duration::from_millis(500));
}
