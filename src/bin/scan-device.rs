//! Process entry point: loads layered settings, initializes logging, and
//! drives the controller through one pair/capture/finalize cycle using
//! the bootstrap hooks of §6. The real frame provider is an external
//! collaborator this binary doesn't implement; it wires in a no-op
//! source so the rest of the pipeline is exercisable end to end.

use scan_device_core::capture::{Frame, FrameSource};
use scan_device_core::config::{BootstrapHooks, Settings};
use scan_device_core::controller::Controller;
use scan_device_core::logging::{self, LogFormat};

struct IdleFrameSource;

#[async_trait::async_trait]
impl FrameSource for IdleFrameSource {
    async fn next_frame(&mut self) -> Option<Frame> {
        None
    }
}

#[tokio::main]
async fn main() -> scan_device_core::ScanResult<()> {
    let bootstrap = BootstrapHooks::from_env();
    let settings = Settings::load(bootstrap)?;

    logging::init(&settings.log_filter, LogFormat::Plain);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "scan-device.starting");

    let controller = Controller::new(settings).await?;

    if controller.settings().bootstrap.autopair {
        match &controller.settings().bootstrap.qr_payload_path {
            Some(path) => {
                let bytes = tokio::fs::read(path).await?;
                controller.pair(&bytes, "scan-device").await?;
                tracing::info!("scan-device.autopair.completed");
            }
            None => tracing::warn!("scan-device.autopair.requested_without_qr_payload_path"),
        }
    }

    if controller.state().await == scan_device_core::controller::ControllerState::Paired {
        let session_id = controller.start_capture(None, IdleFrameSource).await?;
        tracing::info!(session_id = %session_id, "scan-device.capture.started");

        if let Some(secs) = controller.settings().bootstrap.auto_capture_secs {
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
        }

        let session_dir = controller.stop_capture().await?;
        tracing::info!(session_dir = %session_dir.display(), "scan-device.capture.finalized");
    }

    tracing::info!(status = %controller.status().await, "scan-device.exiting");
    Ok(())
}
