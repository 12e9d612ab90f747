use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::activity::ActivitySignal;
use crate::client::RealtimeClient;
use crate::protocol::{ClientItem, ResponseOptions};

pub const GREETING_INSTRUCTIONS: &str = " Welcome the user.";
pub const INACTIVITY_NUDGE: &str =
    "User hasn't response for a while, please say something to continue the conversation.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProactiveConfig {
    pub check_interval: Duration,
    pub idle_threshold: Duration,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            idle_threshold: Duration::from_secs(10),
        }
    }
}

/// Greets on start, then nudges the model once per idle period.
pub struct ProactiveTimer {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ProactiveTimer {
    pub fn start(
        client: Arc<dyn RealtimeClient>,
        activity: ActivitySignal,
        config: ProactiveConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_proactive(client, activity, config, stop_rx));
        Self {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Proactive timer ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

async fn run_proactive(
    client: Arc<dyn RealtimeClient>,
    activity: ActivitySignal,
    config: ProactiveConfig,
    mut stop_rx: oneshot::Receiver<()>,
) {
    info!(
        idle_threshold_ms = config.idle_threshold.as_millis() as u64,
        "Proactive timer started"
    );
    greet(client.as_ref()).await;

    let mut ticker = time::interval(config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Consume the immediate first tick.
    ticker.tick().await;

    let mut nudged_for: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {
                let snapshot = activity.snapshot();
                if snapshot.updated_at.elapsed() < config.idle_threshold
                    || nudged_for == Some(snapshot.updated_at)
                {
                    continue;
                }
                nudged_for = Some(snapshot.updated_at);
                nudge(client.as_ref()).await;
            }
        }
    }
    info!("Proactive timer stopped");
}

async fn greet(client: &dyn RealtimeClient) {
    let options = ResponseOptions {
        additional_instructions: Some(GREETING_INSTRUCTIONS.to_string()),
    };
    if let Err(e) = client.generate_response(Some(options)).await {
        warn!(error = %e, "Failed to request greeting");
    }
}

async fn nudge(client: &dyn RealtimeClient) {
    info!("No activity within threshold; nudging the model");
    if let Err(e) = client
        .send_item(ClientItem::system_text(INACTIVITY_NUDGE))
        .await
    {
        warn!(error = %e, "Failed to send inactivity message");
        return;
    }
    if let Err(e) = client.generate_response(None).await {
        warn!(error = %e, "Failed to request response after inactivity");
    }
}
