pub mod audio;
pub mod config;
pub mod controller;
pub mod debounce;
pub mod effects;
pub mod import;
pub mod logging;
pub mod metrics;
pub mod sensor;
pub mod session;
pub mod state_machine;
pub mod status;
pub mod store;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use audio::{AudioCapture, WaveformRenderer};
use config::ControllerConfig;
use controller::CaptureController;
use effects::{CaptureEffectRunner, EffectRunner};
use logging::LogBuffer;
use state_machine::{Effect, Event, State, StateKind};
use status::{status_channel, StatusHandle, StatusPublisher};
use store::EventStore;

/// Capacity of the controller event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A finished recording not yet in the store.
fn holds_unsaved_record(state: &State) -> bool {
    matches!(
        state,
        State::Rendering { .. } | State::Persisting { .. } | State::Error { retry: Some(_), .. }
    )
}

/// Run the main state loop
///
/// Single consumer of controller events. Returns the controller once the
/// channel closes or a shutdown has drained any recording that already
/// finished (rendering, persisting or waiting on a store retry).
pub async fn run_state_loop(
    mut controller: CaptureController,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    publisher: StatusPublisher,
) -> CaptureController {
    let mut shutting_down = false;

    publisher.publish(controller.status());
    log::info!("State loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        let event = match event {
            Event::Shutdown => {
                log::info!("Shutdown requested");
                shutting_down = true;
                controller.drop_pending();
                // Only a recording is abandoned; later stages run to completion
                (controller.state().kind() == StateKind::Recording).then_some(Event::Cancel)
            }
            Event::Detection(_) if shutting_down => None,
            other => Some(other),
        };

        if let Some(event) = event {
            for eff in controller.handle(event) {
                match eff {
                    Effect::EmitStatus => publisher.publish(controller.status()),
                    other => effect_runner.spawn(other, tx.clone()),
                }
            }
        }

        if shutting_down && !holds_unsaved_record(controller.state()) {
            break;
        }
    }

    // Completions still queued are never handled; their files must not outlive the loop
    rx.close();
    while let Ok(event) = rx.try_recv() {
        if let Event::RecordingOk { id, recording } = event {
            effects::discard_files(id, &[recording.path]);
        }
    }

    publisher.publish(controller.status());
    log::info!("State loop ended");
    controller
}

/// A running controller: state loop, effect runner and status channel.
pub struct CaptureService {
    tx: mpsc::Sender<Event>,
    status: StatusHandle,
    runner: Arc<CaptureEffectRunner>,
    state_loop: JoinHandle<CaptureController>,
}

impl CaptureService {
    /// Spawn the state loop on the current tokio runtime.
    pub fn start(
        config: ControllerConfig,
        capture: Arc<dyn AudioCapture>,
        renderer: Arc<dyn WaveformRenderer>,
        store: Arc<dyn EventStore>,
        logs: LogBuffer,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);
        let (publisher, status) = status_channel(logs);

        let runner = CaptureEffectRunner::new(capture, renderer, store, config.clone());
        let controller = CaptureController::new(config);

        let loop_runner: Arc<dyn EffectRunner> = runner.clone();
        let loop_tx = tx.clone();
        let state_loop = tokio::spawn(async move {
            run_state_loop(controller, rx, loop_tx, loop_runner, publisher).await
        });

        Self {
            tx,
            status,
            runner,
            state_loop,
        }
    }

    /// Sender for sensor pumps and operator commands.
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    pub fn status(&self) -> StatusHandle {
        self.status.clone()
    }

    /// Stop the loop, cancel any recording and wait for cleanup.
    pub async fn shutdown(self) -> Option<CaptureController> {
        if self.tx.send(Event::Shutdown).await.is_err() {
            log::debug!("State loop already stopped");
        }
        let controller = match self.state_loop.await {
            Ok(controller) => Some(controller),
            Err(e) => {
                log::error!("State loop task failed: {}", e);
                None
            }
        };
        self.runner.shutdown().await;
        controller
    }
}
