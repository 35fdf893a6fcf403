use anyhow::Context;
use petoi_link::domain::models::MessageSeverity;
use petoi_link::infrastructure::logging::init_logger;
use petoi_link::{AppEvent, RobotLink, SettingsService, SimulatedTransport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Walks one calibration session against the in-process robot: scan,
/// connect, read offsets, nudge a servo, save, persist and disconnect.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut settings_service = SettingsService::new()?;
    let _log_guard = init_logger(&settings_service.get().log_settings)?;
    info!("Starting Petoi link demo");
    info!("Settings file: {}", settings_service.path().display());

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let events = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                AppEvent::ConnectionStatus(state) => info!("[status] {}", state),
                AppEvent::LogMessage(msg) => match msg.severity {
                    MessageSeverity::Error => error!("[link] {}", msg.message),
                    MessageSeverity::Warning => warn!("[link] {}", msg.message),
                    _ => info!("[link] {}", msg.message),
                },
            }
        }
    });

    let robot = SimulatedTransport::with_robot();
    robot.set_offsets([2, 0, 0, 0, 0, 0, 0, 0, -3, 4, 0, 0, 1, 0, 0, -1]);

    let link = RobotLink::new(
        Arc::new(robot.clone()),
        settings_service.get().link.clone(),
        event_tx,
    );
    link.load_motor_angles(settings_service.motor_angles());
    link.on_message(|frame| info!("Robot says: {}", frame));

    link.start_scan().await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let names = link.stop_scan().await?;
    info!("Found: {:?}", names);

    let device = link
        .select_preferred()
        .await
        .context("Robot bridge not found")?;
    link.establish().await?;
    if let Some(name) = &device.name {
        settings_service.remember_device(name)?;
    }

    let answer_wait = link.settings().idle_timeout() + Duration::from_millis(500);

    link.begin_calibration().await?;
    tokio::time::sleep(answer_wait).await;
    info!("Offsets: {:?}", link.motor_angles().to_array());

    let angle = link.nudge_servo(9, -2).await?;
    info!("Servo 9 offset now {}", angle);
    tokio::time::sleep(answer_wait).await;
    info!("Robot answered {:?}", link.peek_top_response());

    link.save_calibration().await?;
    tokio::time::sleep(answer_wait).await;
    settings_service.update_motor_angles(&link.motor_angles())?;

    let rest = link.request("d").await?;
    info!("Rest acknowledged: {}", rest);

    for token in link.history() {
        info!("  {:<8} -> {:?}", token.command, token.response);
    }

    link.disconnect_with(|| info!("Link closed")).await?;
    drop(link);
    let _ = events.await;
    Ok(())
}
