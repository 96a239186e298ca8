// End-to-end messaging: blocking calls, pub/sub fan-out, relay.

mod support;

use std::time::Duration;

use serde_json::{json, Value};

use armature::{args, Message, Service, ServiceContext};
use support::{wait_until, LocalHub, Recorder};

fn spawn_service(
    hub: &std::sync::Arc<LocalHub>,
    ctx: &ServiceContext,
    name: &str,
) -> Service<Recorder> {
    let mut svc = Service::new(name, Recorder::new("Recorder"), ctx.clone());
    hub.register(name, svc.mailbox());
    svc.start_service();
    svc
}

#[tokio::test]
async fn blocking_call_round_trip() {
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let ctx = ServiceContext::new(hub.clone()).with_cfg_dir(dir.path());

    let mut responder = spawn_service(&hub, &ctx, "responder");
    let mut caller = spawn_service(&hub, &ctx, "caller");

    let answer = caller.send_blocking("responder", "add", args![2, 3]).await;
    assert_eq!(answer, json!(5));

    caller.stop_service().await;
    responder.stop_service().await;
}

#[tokio::test]
async fn blocking_call_to_missing_service_times_out_to_null() {
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let ctx = ServiceContext::new(hub.clone()).with_cfg_dir(dir.path());

    let mut caller = spawn_service(&hub, &ctx, "caller");
    let started = std::time::Instant::now();
    let answer = caller
        .send_blocking_with("ghost", Duration::from_millis(50), "add", args![1, 2])
        .await;
    assert_eq!(answer, Value::Null);
    // the full timeout elapsed; the call neither failed fast nor hung
    assert!(started.elapsed() >= Duration::from_millis(45));
    assert!(started.elapsed() < Duration::from_secs(2));

    caller.stop_service().await;
}

#[tokio::test]
async fn failed_invocation_answers_blocked_caller_with_null() {
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let ctx = ServiceContext::new(hub.clone()).with_cfg_dir(dir.path());

    let mut responder = spawn_service(&hub, &ctx, "responder");
    let mut caller = spawn_service(&hub, &ctx, "caller");

    let answer = caller.send_blocking("responder", "boom", ()).await;
    assert_eq!(answer, Value::Null);

    // the responder's loop survived the failure
    let answer = caller.send_blocking("responder", "add", args![4, 4]).await;
    assert_eq!(answer, json!(8));

    caller.stop_service().await;
    responder.stop_service().await;
}

#[tokio::test]
async fn fan_out_delivers_exactly_once_per_subscriber() {
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let ctx = ServiceContext::new(hub.clone()).with_cfg_dir(dir.path());

    let display = Recorder::new("Display");
    let sink = display.sink.clone();
    let mut display = Service::new("display", display, ctx.clone());
    hub.register("display", display.mailbox());
    display.start_service();

    let mut weather = spawn_service(&hub, &ctx, "weather");

    // callback name is derived: publishTemp subscribes back on onPublishTemp
    display.subscribe("weather", "publishTemp");
    // a blocking call through the same outbox doubles as an ordering barrier
    display.send_blocking("weather", "getCount", ()).await;

    weather.invoke("publishTemp", args![21.5]);
    assert!(wait_until(|| sink.lock().len() == 1).await);
    assert_eq!(sink.lock()[0], ("onPublishTemp".to_string(), json!(21.5)));

    // no duplicate delivery trickles in later
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.lock().len(), 1);

    // after unsubscribe nothing more arrives
    display.unsubscribe("weather", "publishTemp");
    display.send_blocking("weather", "getCount", ()).await;
    weather.invoke("publishTemp", args![30.0]);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.lock().len(), 1);

    display.stop_service().await;
    weather.stop_service().await;
}

#[tokio::test]
async fn blocking_call_to_subscribed_method_delivers_once() {
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let ctx = ServiceContext::new(hub.clone()).with_cfg_dir(dir.path());

    let display = Recorder::new("Display");
    let sink = display.sink.clone();
    let mut display = Service::new("display", display, ctx.clone());
    hub.register("display", display.mailbox());
    display.start_service();

    let mut weather = spawn_service(&hub, &ctx, "weather");

    display.subscribe("weather", "publishTemp");
    display.send_blocking("weather", "getCount", ()).await;

    // the answer to the blocking call carries the subscribed method name;
    // only the publish event may reach the subscriber
    let answer = display.send_blocking("weather", "publishTemp", args![21.5]).await;
    assert_eq!(answer, json!(21.5));

    assert!(wait_until(|| sink.lock().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sink.lock().len(), 1);

    display.stop_service().await;
    weather.stop_service().await;
}

#[tokio::test]
async fn misaddressed_message_is_relayed_not_invoked() {
    let hub = LocalHub::new();
    let dir = tempfile::tempdir().unwrap();
    let ctx = ServiceContext::new(hub.clone()).with_cfg_dir(dir.path());

    let display = Recorder::new("Display");
    let sink = display.sink.clone();
    let mut display = Service::new("display", display, ctx.clone());
    hub.register("display", display.mailbox());
    display.start_service();

    let mut weather = spawn_service(&hub, &ctx, "weather");

    // enqueue a message for "display" into weather's inbox; its loop must
    // route it onward instead of invoking it locally
    weather.mailbox().add(Message::new("display", "onPublishTemp", args![5.5]));

    assert!(wait_until(|| sink.lock().len() == 1).await);
    assert_eq!(sink.lock()[0].1, json!(5.5));

    display.stop_service().await;
    weather.stop_service().await;
}
