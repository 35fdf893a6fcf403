use petoi_link::infrastructure::bluetooth::{ChannelHandle, ChannelProperties};
use petoi_link::{
    AppEvent, ConnectionState, DeviceHandle, DiscoveredDevice, Frame, LinkError, LinkSettings,
    RobotLink, SimulatedTransport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn new_link(robot: &SimulatedTransport) -> (RobotLink, mpsc::UnboundedReceiver<AppEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let link = RobotLink::new(Arc::new(robot.clone()), LinkSettings::default(), tx);
    (link, rx)
}

async fn select_robot(link: &RobotLink) {
    link.start_scan().await.unwrap();
    link.stop_scan().await.unwrap();
    link.select_preferred().await.unwrap();
}

async fn ready_link(robot: &SimulatedTransport) -> (RobotLink, mpsc::UnboundedReceiver<AppEvent>) {
    let (link, rx) = new_link(robot);
    select_robot(&link).await;
    link.establish().await.unwrap();
    (link, rx)
}

/// Long enough for the idle timeout to close a frame.
async fn quiet_period() {
    tokio::time::sleep(Duration::from_millis(1500)).await;
}

fn states(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let AppEvent::ConnectionStatus(state) = event {
            seen.push(state);
        }
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn connect_walks_through_every_state() {
    let robot = SimulatedTransport::with_robot();
    let (link, mut rx) = ready_link(&robot).await;

    assert_eq!(
        states(&mut rx),
        vec![
            ConnectionState::Scanning,
            ConnectionState::Idle,
            ConnectionState::DeviceSelected,
            ConnectionState::Connecting,
            ConnectionState::LinkUp,
            ConnectionState::DiscoveringChannels,
            ConnectionState::Ready,
        ]
    );
    assert!(link.is_polling());
    assert!(robot.is_subscribed());
    assert_eq!(robot.clear_calls(), 1);
    let channels = link.channels().unwrap();
    assert_eq!(channels.read.id, "ffe1");
    assert_eq!(channels.write.id, "ffe2");
}

#[tokio::test(start_paused = true)]
async fn response_is_attached_after_idle_timeout() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = ready_link(&robot).await;

    link.send_command("c8 10").await.unwrap();
    assert_eq!(link.peek_top_response(), "");

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(link.peek_top_response(), "");

    quiet_period().await;
    assert_eq!(link.peek_top_response(), "c8,10,");
    let history = link.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].command, "c8 10");
    assert_eq!(robot.commands(), vec!["c8 10"]);
}

#[tokio::test(start_paused = true)]
async fn on_message_receives_attributed_frames() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = ready_link(&robot).await;
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    link.on_message(move |frame: &Frame| sink.lock().unwrap().push(frame.to_string()));

    link.send_command("g").await.unwrap();
    quiet_period().await;
    link.send_command("d").await.unwrap();
    quiet_period().await;

    assert_eq!(*frames.lock().unwrap(), vec!["g", "d"]);
}

#[tokio::test(start_paused = true)]
async fn unsolicited_output_is_dropped() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = ready_link(&robot).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    link.on_message(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    robot.inject(b"Ready!\r\n");
    quiet_period().await;

    assert!(link.history().is_empty());
    assert_eq!(link.peek_top_response(), "");
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn history_keeps_the_fifteen_newest_commands() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = ready_link(&robot).await;

    for i in 0..16 {
        link.send_command(&format!("k{}", i)).await.unwrap();
    }

    let history = link.history();
    assert_eq!(history.len(), 15);
    assert_eq!(history[0].command, "k1");
    assert_eq!(history[14].command, "k15");
}

#[tokio::test(start_paused = true)]
async fn calibration_session() {
    let robot = SimulatedTransport::with_robot();
    robot.set_offsets([1, 0, 0, 0, 0, 0, 0, 0, -3, 4, 0, 0, 0, 0, 0, 2]);
    let (link, _rx) = ready_link(&robot).await;
    link.send_command("d").await.unwrap();
    quiet_period().await;

    link.begin_calibration().await.unwrap();
    quiet_period().await;
    assert_eq!(link.history().len(), 1);
    assert_eq!(link.motor_angles().to_array(), robot.offsets());

    assert_eq!(link.nudge_servo(9, -2).await.unwrap(), 2);
    assert_eq!(link.get_motor_angle(9).unwrap(), 2);
    assert_eq!(robot.offsets()[9], 2);
    quiet_period().await;
    assert_eq!(link.peek_top_response(), "c9,2,");

    assert_eq!(link.nudge_servo(3, 1).await, Err(LinkError::InvalidServo(3)));
    assert_eq!(link.nudge_servo(9, 12).await, Err(LinkError::InvalidAdjustment(12)));

    link.reset_servo(8).await.unwrap();
    assert_eq!(robot.offsets()[8], 0);
    assert_eq!(link.get_motor_angle(8).unwrap(), 0);

    link.save_calibration().await.unwrap();
    assert_eq!(robot.commands().last().map(String::as_str), Some("s"));
}

#[tokio::test(start_paused = true)]
async fn back_to_back_commands_only_see_their_own_reply() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = ready_link(&robot).await;

    link.send_command("c8 5").await.unwrap();
    link.send_command("c9 -1").await.unwrap();
    quiet_period().await;

    let history = link.history();
    assert_eq!(history[0].response, "");
    assert_eq!(history[1].response, "c9,-1,");
}

#[tokio::test(start_paused = true)]
async fn request_waits_for_its_answer() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = ready_link(&robot).await;

    let waiting = link.clone();
    let pending = tokio::spawn(async move { waiting.request("g").await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(link.send_command("d").await, Err(LinkError::CommandInFlight));
    assert_eq!(link.request("d").await, Err(LinkError::CommandInFlight));
    // refused sends leave no trace on the stack or the radio
    assert_eq!(link.history().len(), 1);
    assert_eq!(robot.commands(), vec!["g"]);

    assert_eq!(pending.await.unwrap().unwrap(), "g");
    assert_eq!(link.history()[0].response, "g");
    link.send_command("d").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn calibration_waits_for_a_pending_request() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = ready_link(&robot).await;

    let waiting = link.clone();
    let pending = tokio::spawn(async move { waiting.request("g").await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(link.begin_calibration().await, Err(LinkError::CommandInFlight));
    let history = link.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].command, "g");

    assert_eq!(pending.await.unwrap().unwrap(), "g");
}

#[tokio::test(start_paused = true)]
async fn failed_write_leaves_no_pending_command() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = ready_link(&robot).await;
    link.send_command("d").await.unwrap();
    quiet_period().await;

    robot.set_fail_write(true);
    assert!(matches!(
        link.send_command("g").await,
        Err(LinkError::Transport(_))
    ));
    assert!(matches!(link.request("g").await, Err(LinkError::Transport(_))));
    let history = link.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].command, "d");

    robot.set_fail_write(false);
    robot.inject(b"late\r\n");
    quiet_period().await;
    assert_eq!(link.history()[0].response, "late");
    assert_eq!(link.request("g").await.unwrap(), "g");
}

#[tokio::test(start_paused = true)]
async fn request_times_out_on_a_silent_robot() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = ready_link(&robot).await;
    robot.set_silent(true);

    assert_eq!(link.request("d").await, Err(LinkError::ResponseTimeout));
    link.send_command("g").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn commands_need_a_ready_link() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = new_link(&robot);

    assert_eq!(
        link.send_command("d").await,
        Err(LinkError::NotReady(ConnectionState::Idle))
    );
    assert_eq!(link.establish().await, Err(LinkError::NoDeviceSelected));
    assert_eq!(
        link.select_device_by_name("Nope").await,
        Err(LinkError::DeviceNotFound("Nope".to_string()))
    );
    assert!(robot.written_packets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn link_that_never_comes_up_fails_exactly_once() {
    let robot = SimulatedTransport::with_robot();
    robot.set_link_after_polls(None);
    let (link, _rx) = new_link(&robot);
    select_robot(&link).await;

    let successes = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(Mutex::new(Vec::new()));
    let s = successes.clone();
    let f = failures.clone();
    link.connect(
        move || {
            s.fetch_add(1, Ordering::SeqCst);
        },
        move |e| f.lock().unwrap().push(e),
    )
    .await
    .unwrap();

    assert_eq!(successes.load(Ordering::SeqCst), 0);
    assert_eq!(
        *failures.lock().unwrap(),
        vec![LinkError::ConnectTimeout { attempts: 10 }]
    );
    assert_eq!(robot.polls(), 10);
    assert_eq!(robot.disconnect_calls(), 1);
    assert_eq!(link.state(), ConnectionState::Failed);
    assert!(!link.is_polling());
}

#[tokio::test(start_paused = true)]
async fn slow_link_still_connects() {
    let robot = SimulatedTransport::with_robot();
    robot.set_link_after_polls(Some(3));
    let (link, _rx) = new_link(&robot);
    select_robot(&link).await;

    let start = tokio::time::Instant::now();
    link.establish().await.unwrap();

    assert_eq!(robot.polls(), 4);
    assert_eq!(link.state(), ConnectionState::Ready);
    // three retry delays plus the settle delay
    assert!(start.elapsed() >= Duration::from_secs(20));
}

#[tokio::test(start_paused = true)]
async fn single_channel_fails_but_keeps_link() {
    let robot = SimulatedTransport::with_robot();
    robot.set_channels(vec![ChannelHandle::new("ffe1")]);
    let (link, _rx) = new_link(&robot);
    select_robot(&link).await;

    assert_eq!(
        link.establish().await,
        Err(LinkError::MissingChannels { found: 1 })
    );
    assert_eq!(link.state(), ConnectionState::Failed);
    assert_eq!(robot.disconnect_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn subscribe_failure_fails_the_connection() {
    let robot = SimulatedTransport::with_robot();
    robot.set_fail_subscribe(true);
    let (link, _rx) = new_link(&robot);
    select_robot(&link).await;

    let result = link.establish().await;
    assert!(matches!(result, Err(LinkError::SubscribeFailed(_))));
    assert_eq!(link.state(), ConnectionState::Failed);
    assert_eq!(
        link.send_command("d").await,
        Err(LinkError::NotReady(ConnectionState::Failed))
    );
}

#[tokio::test(start_paused = true)]
async fn declared_capabilities_pick_the_channels() {
    let robot = SimulatedTransport::with_robot();
    let write_only = ChannelProperties {
        notify: false,
        write: true,
    };
    let notify_only = ChannelProperties {
        notify: true,
        write: false,
    };
    robot.set_channels(vec![
        ChannelHandle::with_properties("tx", write_only),
        ChannelHandle::with_properties("rx", notify_only),
    ]);
    let (link, _rx) = ready_link(&robot).await;

    let channels = link.channels().unwrap();
    assert_eq!(channels.read.id, "rx");
    assert_eq!(channels.write.id, "tx");
    link.send_command("g").await.unwrap();
    quiet_period().await;
    assert_eq!(link.peek_top_response(), "g");
}

#[tokio::test(start_paused = true)]
async fn disconnect_and_reconnect() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = ready_link(&robot).await;

    let done = Arc::new(AtomicUsize::new(0));
    let d = done.clone();
    link.disconnect_with(move || {
        d.fetch_add(1, Ordering::SeqCst);
    })
    .await
    .unwrap();

    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(link.state(), ConnectionState::Disconnected);
    assert!(!link.is_polling());
    assert!(!robot.is_subscribed());
    assert_eq!(
        link.send_command("d").await,
        Err(LinkError::NotReady(ConnectionState::Disconnected))
    );

    link.establish().await.unwrap();
    assert_eq!(robot.connect_calls(), 2);
    link.send_command("d").await.unwrap();
    quiet_period().await;
    assert_eq!(link.peek_top_response(), "d");
}

#[tokio::test(start_paused = true)]
async fn disconnect_abandons_a_running_connect() {
    let robot = SimulatedTransport::with_robot();
    robot.set_link_after_polls(None);
    let (link, _rx) = new_link(&robot);
    select_robot(&link).await;

    let connecting = link.clone();
    let attempt = tokio::spawn(async move { connecting.establish().await });
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(link.state().is_connecting());

    link.disconnect().await.unwrap();
    assert_eq!(link.state(), ConnectionState::Disconnected);

    assert_eq!(attempt.await.unwrap(), Err(LinkError::ConnectCancelled));
    assert_eq!(link.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn second_connect_is_rejected_while_one_runs() {
    let robot = SimulatedTransport::with_robot();
    robot.set_link_after_polls(Some(2));
    let (link, _rx) = new_link(&robot);
    select_robot(&link).await;

    let connecting = link.clone();
    let attempt = tokio::spawn(async move { connecting.establish().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(link.establish().await, Err(LinkError::AlreadyConnecting));
    assert_eq!(attempt.await.unwrap(), Ok(()));
    assert_eq!(robot.connect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn selecting_another_device_drops_the_old_link() {
    let robot = SimulatedTransport::with_robot();
    robot.add_peripheral(DiscoveredDevice {
        handle: DeviceHandle("sim-robot-2".to_string()),
        name: Some("Bittle".to_string()),
    });
    let (link, _rx) = ready_link(&robot).await;

    let other = link.select_device_by_name("Bittle").await.unwrap();
    assert_eq!(other.handle.0, "sim-robot-2");
    assert_eq!(robot.disconnect_calls(), 1);
    assert_eq!(link.state(), ConnectionState::DeviceSelected);
    assert!(!link.is_polling());

    link.establish().await.unwrap();
    assert_eq!(link.selected_device().unwrap().handle.0, "sim-robot-2");
}

#[tokio::test(start_paused = true)]
async fn stopping_a_scan_restores_the_previous_state() {
    let robot = SimulatedTransport::with_robot();
    let (link, _rx) = new_link(&robot);
    select_robot(&link).await;
    assert_eq!(link.state(), ConnectionState::DeviceSelected);

    link.start_scan().await.unwrap();
    assert_eq!(link.state(), ConnectionState::Scanning);
    link.stop_scan().await.unwrap();
    assert_eq!(link.state(), ConnectionState::DeviceSelected);

    robot.set_channels(vec![ChannelHandle::new("ffe1")]);
    assert!(link.establish().await.is_err());
    link.start_scan().await.unwrap();
    link.start_scan().await.unwrap();
    link.stop_scan().await.unwrap();
    assert_eq!(link.state(), ConnectionState::Failed);
}
