use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rusqlite::Connection;
use subtrack_core::config::SchedulerConfig;
use subtrack_core::time::start_of_day;
use subtrack_core::types::{Category, Currency, Frequency, SubscriptionStatus, UserId, WorkflowHandle};
use subtrack_scheduler::{
    Checkpoint, InstanceStatus, ManualClock, NotificationDispatcher, NotifyError, RetryPolicy,
    SchedulerEngine, SubscriptionTracker, WorkflowAdmin, WorkflowExecutor, WorkflowLifecycleManager,
    WorkflowStore,
};
use subtrack_subscriptions::{NewSubscription, Subscription, SubscriptionFields, SubscriptionStore};
use subtrack_users::{NewUser, UserContact, UserDirectory};

/// Records every reminder it is asked to send. Fails the first `fail_first`
/// calls with `failure`.
struct RecordingDispatcher {
    sent: Mutex<Vec<(String, u32, NaiveDate)>>,
    calls: AtomicU32,
    fail_first: u32,
    failure: fn() -> NotifyError,
}

impl RecordingDispatcher {
    fn ok() -> Self {
        Self::failing(0, || NotifyError::Transport("unused".into()))
    }

    fn failing(fail_first: u32, failure: fn() -> NotifyError) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            fail_first,
            failure,
        }
    }

    fn sent(&self) -> Vec<(String, u32, NaiveDate)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(
        &self,
        to: &UserContact,
        checkpoint: &Checkpoint,
        subscription: &Subscription,
    ) -> Result<(), NotifyError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
            return Err((self.failure)());
        }
        subtrack_scheduler::notifier::render(to, checkpoint, subscription)?;
        self.sent.lock().unwrap().push((
            subscription.id.to_string(),
            checkpoint.offset_days,
            checkpoint.date,
        ));
        Ok(())
    }
}

struct Harness {
    db: Arc<Mutex<Connection>>,
    clock: Arc<ManualClock>,
    subs: Arc<SubscriptionStore>,
    workflows: Arc<WorkflowStore>,
    lifecycle: Arc<WorkflowLifecycleManager>,
    tracker: SubscriptionTracker,
    admin: WorkflowAdmin,
    engine: SchedulerEngine,
    dispatcher: Arc<RecordingDispatcher>,
    owner: UserId,
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn harness_with(dispatcher: RecordingDispatcher) -> Harness {
    let conn = Connection::open_in_memory().unwrap();
    subtrack_users::db::init_db(&conn).unwrap();
    subtrack_subscriptions::db::init_db(&conn).unwrap();
    subtrack_scheduler::db::init_db(&conn).unwrap();
    let db = Arc::new(Mutex::new(conn));

    let clock = Arc::new(ManualClock::on(d(2025, 1, 30), 9));
    let config = SchedulerConfig {
        stop_ack_timeout_ms: 50,
        retry_backoff_ms: 1,
        step_retries: 3,
        ..SchedulerConfig::default()
    };
    let subs = Arc::new(SubscriptionStore::new(db.clone(), clock.clone()));
    let users = Arc::new(UserDirectory::new(db.clone()));
    let workflows = Arc::new(WorkflowStore::new(db.clone(), clock.clone()));
    let lifecycle = Arc::new(WorkflowLifecycleManager::new(
        subs.clone(),
        workflows.clone(),
        "http://127.0.0.1:5500/api/v1/workflows/subscription/reminder",
        &config,
    ));
    let dispatcher = Arc::new(dispatcher);
    let executor = Arc::new(WorkflowExecutor::new(
        subs.clone(),
        users.clone(),
        workflows.clone(),
        dispatcher.clone(),
        lifecycle.clone(),
        RetryPolicy::from_config(&config),
    ));
    let engine = SchedulerEngine::new(workflows.clone(), executor, lifecycle.clone(), config);
    let owner = users
        .register(&NewUser {
            name: "Ada Lovelace".into(),
            email: "ada@example.com".into(),
            password: "analytical".into(),
            role: Default::default(),
        })
        .unwrap()
        .id;

    Harness {
        db,
        tracker: SubscriptionTracker::new(subs.clone(), users, lifecycle.clone(), clock.clone()),
        admin: WorkflowAdmin::new(workflows.clone(), subs.clone()),
        clock,
        subs,
        workflows,
        lifecycle,
        engine,
        dispatcher,
        owner,
    }
}

fn harness() -> Harness {
    harness_with(RecordingDispatcher::ok())
}

impl Harness {
    async fn monthly_from_jan_1(&self) -> Subscription {
        self.tracker
            .create(&NewSubscription {
                name: "Netflix".into(),
                price: 15.99,
                currency: Currency::Usd,
                frequency: Frequency::Monthly,
                category: Category::Entertainment,
                payment_method: "Visa 4242".into(),
                start_date: d(2025, 1, 1),
                owner: self.owner.clone(),
            })
            .await
            .unwrap()
    }

    fn at(&self, date: NaiveDate, hour: i64) {
        self.clock.set(start_of_day(date) + chrono::Duration::hours(hour));
    }

    fn handle_of(&self, sub: &Subscription) -> Option<WorkflowHandle> {
        self.subs.get(&sub.id).unwrap().unwrap().workflow_handle
    }

    fn live(&self) -> Vec<WorkflowHandle> {
        self.workflows
            .list_active()
            .unwrap()
            .into_iter()
            .map(|i| i.handle)
            .collect()
    }

    /// Put a parked instance back in the queue as if the process had
    /// restarted mid-run.
    fn requeue(&self, handle: &WorkflowHandle) {
        self.db
            .lock()
            .unwrap()
            .execute(
                "UPDATE workflow_instances SET status = 'running' WHERE handle = ?1",
                [handle.as_str()],
            )
            .unwrap();
        self.workflows.recover_interrupted().unwrap();
    }
}

#[tokio::test]
async fn full_cycle_sends_due_reminders_and_renews_once() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    assert_eq!(sub.renewal_date, Some(d(2025, 2, 1)));
    let h1 = sub.workflow_handle.clone().unwrap();

    // Jan 30: 7d, 5d and 2d have already elapsed; the instance parks for 1d.
    assert_eq!(h.engine.tick().await.unwrap(), 1);
    let instance = h.workflows.get(&h1).unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Sleeping);
    assert_eq!(instance.current_step.as_deref(), Some("sleep:1d"));
    assert_eq!(instance.wake_at, Some(start_of_day(d(2025, 1, 31))));
    assert!(h.dispatcher.sent().is_empty());

    // Nothing is due before midnight.
    h.at(d(2025, 1, 30), 23);
    assert_eq!(h.engine.tick().await.unwrap(), 0);

    // Jan 31: the one-day reminder goes out and the instance parks for 0d.
    h.at(d(2025, 1, 31), 9);
    assert_eq!(h.engine.tick().await.unwrap(), 1);
    assert_eq!(
        h.dispatcher.sent(),
        vec![(sub.id.to_string(), 1, d(2025, 1, 31))]
    );
    assert_eq!(
        h.workflows.get(&h1).unwrap().unwrap().current_step.as_deref(),
        Some("sleep:0d")
    );

    // A replay after a restart does not repeat the reminder.
    h.requeue(&h1);
    assert_eq!(h.engine.tick().await.unwrap(), 1);
    assert_eq!(h.dispatcher.sent().len(), 1);
    assert_eq!(h.workflows.status_of(&h1).unwrap(), Some(InstanceStatus::Sleeping));

    // Feb 1: renew and hand over to exactly one new instance.
    h.at(d(2025, 2, 1), 9);
    assert_eq!(h.engine.tick().await.unwrap(), 1);
    assert_eq!(h.workflows.status_of(&h1).unwrap(), Some(InstanceStatus::Completed));
    let renewed = h.subs.get(&sub.id).unwrap().unwrap();
    assert_eq!(renewed.renewal_date, Some(d(2025, 3, 1)));
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    let h2 = renewed.workflow_handle.unwrap();
    assert_ne!(h2, h1);
    assert_eq!(h.live(), vec![h2.clone()]);
    assert_eq!(h.dispatcher.sent().len(), 1);

    // The new cycle starts by parking for its 7-day reminder.
    assert_eq!(h.engine.tick().await.unwrap(), 1);
    let next = h.workflows.get(&h2).unwrap().unwrap();
    assert_eq!(next.status, InstanceStatus::Sleeping);
    assert_eq!(next.wake_at, Some(start_of_day(d(2025, 2, 22))));
}

#[tokio::test]
async fn completed_instance_replay_does_not_renew_twice() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.engine.tick().await.unwrap();
    h.at(d(2025, 2, 1), 9);
    h.engine.tick().await.unwrap();
    let h2 = h.handle_of(&sub).unwrap();

    // Replay the finished instance from its journal.
    h.requeue(&h1);
    h.engine.tick().await.unwrap();

    let after = h.subs.get(&sub.id).unwrap().unwrap();
    assert_eq!(after.renewal_date, Some(d(2025, 3, 1)));
    assert_eq!(after.workflow_handle, Some(h2.clone()));
    assert_eq!(h.workflows.list_for_subscription(&sub.id).unwrap().len(), 2);
}

#[tokio::test]
async fn cancel_while_sleeping_never_notifies_nor_renews() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.engine.tick().await.unwrap();
    assert_eq!(h.workflows.status_of(&h1).unwrap(), Some(InstanceStatus::Sleeping));

    h.tracker.cancel(&sub.id).await.unwrap();
    assert_eq!(h.workflows.status_of(&h1).unwrap(), Some(InstanceStatus::Cancelled));

    h.at(d(2025, 1, 31), 9);
    assert_eq!(h.engine.tick().await.unwrap(), 0);
    h.at(d(2025, 2, 1), 9);
    assert_eq!(h.engine.tick().await.unwrap(), 0);

    assert!(h.dispatcher.sent().is_empty());
    let after = h.subs.get(&sub.id).unwrap().unwrap();
    assert_eq!(after.renewal_date, Some(d(2025, 2, 1)));
    assert_eq!(after.status, SubscriptionStatus::Cancelled);
}

#[tokio::test]
async fn update_supersedes_the_old_instance() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.engine.tick().await.unwrap();

    let patch = SubscriptionFields {
        name: Some("Netflix Premium".into()),
        ..SubscriptionFields::default()
    };
    let updated = h.tracker.update(&sub.id, &patch).await.unwrap();
    let h2 = updated.workflow_handle.unwrap();
    assert_ne!(h1, h2);
    assert_eq!(h.workflows.status_of(&h1).unwrap(), Some(InstanceStatus::Cancelled));
    assert_eq!(h.live(), vec![h2.clone()]);

    h.at(d(2025, 2, 1), 9);
    assert_eq!(h.engine.tick().await.unwrap(), 1);
    let renewed = h.subs.get(&sub.id).unwrap().unwrap();
    assert_eq!(renewed.renewal_date, Some(d(2025, 3, 1)));
    assert_eq!(h.workflows.status_of(&h2).unwrap(), Some(InstanceStatus::Completed));
    assert_eq!(h.live().len(), 1);
}

#[tokio::test]
async fn superseded_instance_aborts_on_wake() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.engine.tick().await.unwrap();

    // Point the record elsewhere without stopping the old instance.
    let other = WorkflowHandle::from("wfr_other");
    assert!(h.subs.swap_workflow_handle(&sub.id, Some(&h1), Some(&other)).unwrap());

    h.at(d(2025, 1, 31), 9);
    assert_eq!(h.engine.tick().await.unwrap(), 1);
    let instance = h.workflows.get(&h1).unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Aborted);
    assert_eq!(instance.detail.as_deref(), Some("superseded by a newer instance"));
    assert!(h.dispatcher.sent().is_empty());
}

#[tokio::test]
async fn unsupported_stored_frequency_fails_without_rearm() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.db
        .lock()
        .unwrap()
        .execute(
            "UPDATE subscriptions SET frequency = 'hourly' WHERE id = ?1",
            [sub.id.as_str()],
        )
        .unwrap();

    assert_eq!(h.engine.tick().await.unwrap(), 1);
    assert_eq!(h.workflows.status_of(&h1).unwrap(), Some(InstanceStatus::Failed));
    let failed = h.admin.failed().unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().unwrap().contains("hourly"));
    assert!(h.live().is_empty());
}

#[tokio::test]
async fn in_doubt_reminder_is_not_resent() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.engine.tick().await.unwrap();

    // A previous run died between marking the send and recording it.
    h.workflows.begin_step(&h1, "notify:1d").unwrap();

    h.at(d(2025, 1, 31), 9);
    assert_eq!(h.engine.tick().await.unwrap(), 1);
    assert!(h.dispatcher.sent().is_empty());
    assert_eq!(h.workflows.status_of(&h1).unwrap(), Some(InstanceStatus::Sleeping));
}

#[tokio::test]
async fn transient_notify_failures_are_retried() {
    let h = harness_with(RecordingDispatcher::failing(2, || {
        NotifyError::Transport("connection reset".into())
    }));
    let sub = h.monthly_from_jan_1().await;
    h.engine.tick().await.unwrap();
    h.at(d(2025, 1, 31), 9);
    h.engine.tick().await.unwrap();
    assert_eq!(h.dispatcher.sent(), vec![(sub.id.to_string(), 1, d(2025, 1, 31))]);
}

#[tokio::test]
async fn rejected_reminder_is_logged_and_renewal_proceeds() {
    let h = harness_with(RecordingDispatcher::failing(u32::MAX, || NotifyError::Rejected {
        status: 400,
        body: "bad recipient".into(),
    }));
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.engine.tick().await.unwrap();
    h.at(d(2025, 1, 31), 9);
    h.engine.tick().await.unwrap();

    // Rejections are not retried, and the instance keeps going to 0d.
    assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 1);
    let instance = h.workflows.get(&h1).unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Sleeping);
    assert_eq!(instance.current_step.as_deref(), Some("sleep:0d"));
    let undelivered = h.admin.undelivered().unwrap();
    assert_eq!(undelivered.len(), 1);
    assert_eq!(undelivered[0].workflow_run_id, h1);
    assert_eq!(undelivered[0].checkpoint, "1d");
    assert!(undelivered[0].error.contains("bad recipient"));

    // A replay neither resends nor logs the reminder again.
    h.requeue(&h1);
    h.engine.tick().await.unwrap();
    assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.admin.undelivered().unwrap().len(), 1);

    h.at(d(2025, 2, 1), 9);
    h.engine.tick().await.unwrap();
    assert_eq!(h.workflows.status_of(&h1).unwrap(), Some(InstanceStatus::Completed));
    assert_eq!(
        h.subs.get(&sub.id).unwrap().unwrap().renewal_date,
        Some(d(2025, 3, 1))
    );
}

#[tokio::test]
async fn exhausted_transient_failures_park_the_instance() {
    // Three in-run attempts all fail; the fourth call succeeds.
    let h = harness_with(RecordingDispatcher::failing(3, || {
        NotifyError::Transport("connection refused".into())
    }));
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.engine.tick().await.unwrap();
    h.at(d(2025, 1, 31), 9);
    h.engine.tick().await.unwrap();

    let parked = h.workflows.get(&h1).unwrap().unwrap();
    assert_eq!(parked.status, InstanceStatus::Sleeping);
    assert_eq!(parked.retry_count, 1);
    assert_eq!(
        parked.wake_at,
        Some(start_of_day(d(2025, 1, 31)) + chrono::Duration::hours(9) + chrono::Duration::minutes(1))
    );
    assert!(parked.detail.as_deref().unwrap().contains("connection refused"));
    assert!(h.dispatcher.sent().is_empty());

    assert_eq!(h.engine.tick().await.unwrap(), 0);
    h.clock.advance(chrono::Duration::minutes(1));
    assert_eq!(h.engine.tick().await.unwrap(), 1);
    assert_eq!(h.dispatcher.sent(), vec![(sub.id.to_string(), 1, d(2025, 1, 31))]);
    let resumed = h.workflows.get(&h1).unwrap().unwrap();
    assert_eq!(resumed.current_step.as_deref(), Some("sleep:0d"));
    assert_eq!(resumed.retry_count, 0);
    assert!(h.admin.undelivered().unwrap().is_empty());
}

#[tokio::test]
async fn reminder_is_given_up_once_parked_retries_run_out() {
    let h = harness_with(RecordingDispatcher::failing(u32::MAX, || {
        NotifyError::Transport("connection refused".into())
    }));
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.engine.tick().await.unwrap();
    h.at(d(2025, 1, 31), 9);

    let deferrals = SchedulerConfig::default().deferred_retries;
    for round in 1..=deferrals {
        assert_eq!(h.engine.tick().await.unwrap(), 1);
        assert_eq!(h.workflows.get(&h1).unwrap().unwrap().retry_count, round);
        h.clock.advance(chrono::Duration::hours(1));
    }

    // Final round: the reminder is logged and the instance moves on.
    assert_eq!(h.engine.tick().await.unwrap(), 1);
    assert_eq!(h.dispatcher.calls.load(Ordering::SeqCst), 3 * (deferrals + 1));
    let instance = h.workflows.get(&h1).unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Sleeping);
    assert_eq!(instance.current_step.as_deref(), Some("sleep:0d"));
    let undelivered = h.admin.undelivered().unwrap();
    assert_eq!(undelivered.len(), 1);
    assert!(undelivered[0].error.contains("connection refused"));

    h.at(d(2025, 2, 1), 9);
    h.engine.tick().await.unwrap();
    assert_eq!(h.workflows.status_of(&h1).unwrap(), Some(InstanceStatus::Completed));
    assert_eq!(
        h.subs.get(&sub.id).unwrap().unwrap().renewal_date,
        Some(d(2025, 3, 1))
    );
}

#[tokio::test]
async fn month_end_start_renews_on_every_month_end() {
    let h = harness();
    h.at(d(2025, 1, 31), 9);
    let sub = h
        .tracker
        .create(&NewSubscription {
            name: "Gym".into(),
            price: 30.0,
            currency: Currency::Eur,
            frequency: Frequency::Monthly,
            category: Category::Sports,
            payment_method: "Debit".into(),
            start_date: d(2025, 1, 31),
            owner: h.owner.clone(),
        })
        .await
        .unwrap();
    assert_eq!(sub.renewal_date, Some(d(2025, 2, 28)));

    for (renewal_day, expected_next) in [
        (d(2025, 2, 28), d(2025, 3, 31)),
        (d(2025, 3, 31), d(2025, 4, 30)),
        (d(2025, 4, 30), d(2025, 5, 31)),
    ] {
        let handle = h.handle_of(&sub).unwrap();
        h.at(renewal_day, 9);
        h.engine.tick().await.unwrap();
        assert_eq!(h.workflows.status_of(&handle).unwrap(), Some(InstanceStatus::Completed));
        assert_eq!(
            h.subs.get(&sub.id).unwrap().unwrap().renewal_date,
            Some(expected_next)
        );
    }
    assert_eq!(h.workflows.list_for_subscription(&sub.id).unwrap().len(), 4);
}

#[tokio::test]
async fn frequency_change_replaces_the_instance_once() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.engine.tick().await.unwrap();

    let patch = SubscriptionFields {
        frequency: Some(Frequency::Yearly),
        ..SubscriptionFields::default()
    };
    let updated = h.tracker.update(&sub.id, &patch).await.unwrap();
    assert_eq!(updated.renewal_date, Some(d(2025, 2, 1)));
    let h2 = updated.workflow_handle.unwrap();
    assert_ne!(h2, h1);
    assert_eq!(h.workflows.status_of(&h1).unwrap(), Some(InstanceStatus::Cancelled));
    assert_eq!(h.workflows.list_for_subscription(&sub.id).unwrap().len(), 2);
    assert_eq!(h.live(), vec![h2.clone()]);

    // The next cycle is one year from the start date.
    h.at(d(2025, 2, 1), 9);
    h.engine.tick().await.unwrap();
    assert_eq!(h.workflows.status_of(&h2).unwrap(), Some(InstanceStatus::Completed));
    assert_eq!(
        h.subs.get(&sub.id).unwrap().unwrap().renewal_date,
        Some(d(2026, 1, 1))
    );
}

#[tokio::test]
async fn renewal_moved_mid_flight_skips_and_aborts() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.engine.tick().await.unwrap();

    // Moved behind the instance's back: the handle stays the same.
    h.db
        .lock()
        .unwrap()
        .execute(
            "UPDATE subscriptions SET renewal_date = '2025-02-03' WHERE id = ?1",
            [sub.id.as_str()],
        )
        .unwrap();

    // 1d is now due on Feb 2, so the Jan 31 wake skips it.
    h.at(d(2025, 1, 31), 9);
    h.engine.tick().await.unwrap();
    assert!(h.dispatcher.sent().is_empty());
    assert_eq!(
        h.workflows.get(&h1).unwrap().unwrap().current_step.as_deref(),
        Some("sleep:0d")
    );

    h.at(d(2025, 2, 1), 9);
    h.engine.tick().await.unwrap();
    let instance = h.workflows.get(&h1).unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Aborted);
    assert_eq!(instance.detail.as_deref(), Some("renewal date moved"));
    assert!(h.dispatcher.sent().is_empty());
    let after = h.subs.get(&sub.id).unwrap().unwrap();
    assert_eq!(after.renewal_date, Some(d(2025, 2, 3)));
    assert_eq!(after.workflow_handle, Some(h1));
}

#[tokio::test]
async fn lapsed_renewal_aborts_immediately() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();

    // The process was down across the renewal date.
    h.at(d(2025, 2, 3), 9);
    h.engine.tick().await.unwrap();
    let instance = h.workflows.get(&h1).unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Aborted);
    assert_eq!(instance.detail.as_deref(), Some("renewal date already passed"));
    assert!(h.dispatcher.sent().is_empty());
}

#[tokio::test]
async fn sweep_stops_stray_instances() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();
    h.workflows
        .trigger(&subtrack_scheduler::types::NewInstance {
            handle: WorkflowHandle::from("wfr_stray"),
            subscription_id: sub.id.clone(),
            target: h.lifecycle.target().to_string(),
        })
        .unwrap();

    assert_eq!(h.lifecycle.sweep().unwrap(), 1);
    assert_eq!(h.live(), vec![h1]);
}

#[tokio::test]
async fn admin_cancel_detaches_the_subscription() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();

    let running = h.admin.running().unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(
        running[0].workflow_url,
        "http://127.0.0.1:5500/api/v1/workflows/subscription/reminder"
    );

    let report = h.admin.cancel(&h1).unwrap();
    assert!(report.detached);
    assert_eq!(h.handle_of(&sub), None);
    assert_eq!(h.engine.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn engine_loop_stops_on_shutdown() {
    let h = harness();
    let sub = h.monthly_from_jan_1().await;
    let h1 = sub.workflow_handle.clone().unwrap();

    let (tx, rx) = tokio::sync::watch::channel(false);
    let workflows = h.workflows.clone();
    let task = tokio::spawn(h.engine.run(rx));

    let mut parked = false;
    for _ in 0..200 {
        if workflows.status_of(&h1).unwrap() == Some(InstanceStatus::Sleeping) {
            parked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(parked);
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
