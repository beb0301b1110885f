//! Integration tests for the durable job scheduler.

use std::time::Duration;

use chrono::Utc;
use clawd::comm::{ChatTarget, ConversationKey};
use clawd::events::EventBus;
use clawd::scheduler::{Job, JobDue, JobRequest, JobSchedule, JobStore, ScheduleError, Scheduler};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

fn request(message: &str) -> JobRequest {
    JobRequest {
        conversation_key: Some(ConversationKey::from("agent:main:test:dm:1")),
        target: ChatTarget::new("test", "1"),
        message: message.to_string(),
        description: None,
        invoke_backend: false,
    }
}

async fn scheduler(dir: &TempDir) -> (Scheduler, UnboundedReceiver<JobDue>) {
    Scheduler::new(JobStore::new(dir.path().join("jobs.json")), EventBus::new(), None)
        .await
        .unwrap()
}

async fn next_due(rx: &mut UnboundedReceiver<JobDue>) -> JobDue {
    tokio::time::timeout(Duration::from_secs(6), rx.recv())
        .await
        .expect("timed out waiting for job to fire")
        .expect("scheduler channel closed")
}

#[tokio::test]
async fn delayed_job_fires_once_then_disappears() {
    let dir = TempDir::new().unwrap();
    let (sched, mut rx) = scheduler(&dir).await;

    let before = Utc::now();
    let id = sched.schedule_delayed(request("wake up"), 1).await.unwrap();
    let after = Utc::now();

    let listed = sched.list().await;
    assert_eq!(listed.len(), 1);
    let next_run = listed[0].next_run.expect("delayed job has a next run");
    assert!(next_run >= before + chrono::Duration::seconds(1));
    assert!(next_run <= after + chrono::Duration::seconds(1));
    assert_eq!(listed[0].schedule, JobSchedule::Delayed { execute_at: next_run });
    assert_eq!(listed[0].run_count, 0);

    let due = next_due(&mut rx).await;
    assert_eq!(due.job_id, id);
    assert_eq!(due.message, "wake up");
    assert_eq!(due.target, ChatTarget::new("test", "1"));
    assert!(!due.invoke_backend);

    assert!(sched.list().await.is_empty());
    assert!(sched.store().load().await.is_empty());
    assert!(!sched.cancel(&id).await);
    sched.shutdown().await;
}

#[tokio::test]
async fn recurring_job_keeps_firing_until_cancelled() {
    let dir = TempDir::new().unwrap();
    let (sched, mut rx) = scheduler(&dir).await;

    let id = sched.schedule_recurring(request("tick"), 1).await.unwrap();
    assert_eq!(next_due(&mut rx).await.job_id, id);
    assert_eq!(next_due(&mut rx).await.job_id, id);

    let listed = sched.list().await;
    assert_eq!(listed.len(), 1);
    assert!(listed[0].run_count >= 2);
    assert!(listed[0].last_run.is_some());
    assert!(listed[0].next_run.is_some());
    assert_eq!(listed[0].description, "Every 1s");

    assert!(sched.cancel(&id).await);
    assert!(!sched.cancel(&id).await);
    assert!(sched.list().await.is_empty());

    // A tick that raced the cancel may already be queued; nothing after it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while rx.try_recv().is_ok() {}
    assert!(
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.is_err(),
        "cancelled job fired again"
    );
    sched.shutdown().await;
}

#[tokio::test]
async fn jobs_survive_a_restart() {
    let dir = TempDir::new().unwrap();

    let (first, _rx) = scheduler(&dir).await;
    let recurring = first.schedule_recurring(request("hourly"), 3600).await.unwrap();
    let mut cron_req = request("standup");
    cron_req.description = Some("weekday standup".into());
    cron_req.invoke_backend = true;
    let cron = first.schedule_cron(cron_req, "30 9 * * 1-5").await.unwrap();
    first.shutdown().await;
    drop(first);

    let (second, _rx) = scheduler(&dir).await;
    assert_eq!(second.load().await, 2);

    let jobs = second.list().await;
    let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec![recurring.as_str(), cron.as_str()]);

    let standup = &jobs[1];
    assert_eq!(standup.description, "weekday standup");
    assert!(standup.invoke_backend);
    assert_eq!(
        standup.schedule,
        JobSchedule::Cron {
            expression: "30 9 * * 1-5".into()
        }
    );
    assert!(standup.next_run.is_some_and(|t| t > Utc::now()));

    // Loading twice must not duplicate.
    assert_eq!(second.load().await, 2);
    second.shutdown().await;
}

#[tokio::test]
async fn overdue_delayed_job_fires_on_load() {
    let dir = TempDir::new().unwrap();
    let store = JobStore::new(dir.path().join("jobs.json"));
    let overdue = Job {
        id: "job_overdue".into(),
        schedule: JobSchedule::Delayed {
            execute_at: Utc::now() - chrono::Duration::minutes(5),
        },
        conversation_key: None,
        target: ChatTarget::new("test", "1"),
        message: "late".into(),
        description: "Send in 60s".into(),
        invoke_backend: false,
        created_at: Utc::now() - chrono::Duration::minutes(6),
        last_run: None,
        run_count: 0,
    };
    store.save(&[overdue]).await.unwrap();

    let (sched, mut rx) = scheduler(&dir).await;
    assert_eq!(sched.load().await, 1);

    let due = next_due(&mut rx).await;
    assert_eq!(due.job_id, "job_overdue");
    assert_eq!(due.message, "late");
    assert!(sched.list().await.is_empty());
    assert!(
        tokio::time::timeout(Duration::from_millis(1500), rx.recv()).await.is_err(),
        "overdue job fired more than once"
    );
    assert!(sched.store().load().await.is_empty());
    sched.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_are_rejected_synchronously() {
    let dir = TempDir::new().unwrap();
    let (sched, _rx) = scheduler(&dir).await;

    assert_eq!(
        sched.schedule_delayed(request("x"), 0).await,
        Err(ScheduleError::InvalidDelay)
    );
    assert_eq!(
        sched.schedule_recurring(request("x"), 0).await,
        Err(ScheduleError::InvalidInterval)
    );
    assert!(matches!(
        sched.schedule_cron(request("x"), "61 * * * *").await,
        Err(ScheduleError::InvalidExpression { .. })
    ));
    assert!(matches!(
        sched.schedule_cron(request("x"), "every day").await,
        Err(ScheduleError::InvalidExpression { .. })
    ));
    assert_eq!(
        sched.schedule_delayed(request("   "), 10).await,
        Err(ScheduleError::EmptyMessage)
    );

    assert!(sched.list().await.is_empty());
    sched.shutdown().await;
}
