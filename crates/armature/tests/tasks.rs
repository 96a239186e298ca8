// Scheduled tasks driving a live service through its own inbox.

mod support;

use std::time::Duration;

use armature::{Inbox, Message, Service, ServiceContext, TaskScheduler};
use support::{LocalHub, Recorder};

async fn count_of(svc: &Service<Recorder>) -> i64 {
    let name = svc.name().to_string();
    svc.send_blocking(&name, "getCount", ())
        .await
        .as_i64()
        .unwrap_or(-1)
}

#[tokio::test(start_paused = true)]
async fn hundred_ms_task_fires_at_least_nine_times_per_second() {
    let mut inbox = Inbox::new("sensor");
    let scheduler = TaskScheduler::new("sensor", inbox.handle());
    scheduler.add_task(
        "poll",
        Duration::from_millis(100),
        Message::new("sensor", "checkSensor", ()),
    );

    tokio::time::sleep(Duration::from_millis(1000)).await;
    let mut fired = 0;
    while inbox.try_take().is_some() {
        fired += 1;
    }
    assert!(fired >= 9, "fired only {} times in 1000ms", fired);

    scheduler.purge_task("poll");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(inbox.try_take().is_none());
}

#[tokio::test]
async fn repeating_task_pulses_until_purged() {
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let ctx = ServiceContext::new(hub.clone()).with_cfg_dir(dir.path());

    let mut clock = Service::new("clock", Recorder::new("Clock"), ctx);
    hub.register("clock", clock.mailbox());
    clock.start_service();

    clock.add_task("beat", 50, "pulse", ());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(count_of(&clock).await >= 2);

    clock.purge_task("beat");
    // an already-enqueued firing may still drain; after that the count holds
    tokio::time::sleep(Duration::from_millis(100)).await;
    let settled = count_of(&clock).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(count_of(&clock).await, settled);

    clock.stop_service().await;
}

#[tokio::test]
async fn one_shot_task_fires_exactly_once() {
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let ctx = ServiceContext::new(hub.clone()).with_cfg_dir(dir.path());

    let mut clock = Service::new("clock", Recorder::new("Clock"), ctx);
    hub.register("clock", clock.mailbox());
    clock.start_service();

    clock.add_task("kick", 0, "pulse", ());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count_of(&clock).await, 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count_of(&clock).await, 1);

    clock.stop_service().await;
}

#[tokio::test]
async fn rearmed_task_under_same_name_replaces_the_old_one() {
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let ctx = ServiceContext::new(hub.clone()).with_cfg_dir(dir.path());

    let mut clock = Service::new("clock", Recorder::new("Clock"), ctx);
    hub.register("clock", clock.mailbox());
    clock.start_service();

    // the slow task is replaced before it ever fires
    clock.add_task("beat", 60_000, "pulse", ());
    clock.add_task("beat", 50, "pulse", ());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(count_of(&clock).await >= 2);

    clock.purge_tasks();
    clock.stop_service().await;
}
