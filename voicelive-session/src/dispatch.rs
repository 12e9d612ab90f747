//! Server event dispatch loop.
//!
//! One task consumes the session's event stream. Response items are handled
//! one at a time; within a spoken content part the transcript and the audio
//! run as two joined sub-tasks so neither blocks the other.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activity::{Activity, ActivitySignal};
use crate::audio::StreamingPlayer;
use crate::client::{
    AudioPart, ContentPart, EventStream, InputAudioItem, MessageItem, RealtimeClient,
    ResponseItem, ResponseStatus, ResponseStream, ServerEvent,
};
use crate::error::SessionError;
use crate::tools::ToolDispatcher;
use crate::transcript::{AssistantMessageWriter, Transcript};

/// Shared handles the dispatch loop works with.
#[derive(Clone)]
pub struct DispatchContext {
    pub client: Arc<dyn RealtimeClient>,
    pub transcript: Transcript,
    pub activity: ActivitySignal,
    pub player: Arc<StreamingPlayer>,
    pub tools: Arc<ToolDispatcher>,
    /// Cleared on intentional teardown so late stream errors are not reported.
    pub live: Arc<AtomicBool>,
}

pub fn spawn_dispatch_loop(ctx: DispatchContext, events: EventStream) -> JoinHandle<()> {
    tokio::spawn(run_dispatch_loop(ctx, events))
}

async fn run_dispatch_loop(ctx: DispatchContext, mut events: EventStream) {
    while let Some(event) = events.recv().await {
        let result = match event {
            Ok(ServerEvent::Response(response)) => handle_response(&ctx, response).await,
            Ok(ServerEvent::InputAudio(item)) => {
                handle_input_audio(&ctx.transcript, &ctx.activity, &ctx.player, item).await;
                Ok(())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            if ctx.live.load(Ordering::SeqCst) {
                error!(error = %e, "Failed to handle server event");
            } else {
                debug!(error = %e, "Ignoring server event error after teardown");
            }
        }
    }
    info!("Server event stream closed");
}

pub(crate) async fn handle_response(
    ctx: &DispatchContext,
    mut response: ResponseStream,
) -> Result<(), SessionError> {
    debug!(response_id = %response.id, "Response started");
    while let Some(item) = response.items.recv().await {
        match item {
            ResponseItem::Message(message) => {
                handle_message(ctx, message).await;
            }
            ResponseItem::FunctionCall(call) => {
                let pending = call.wait_for_completion().await;
                if !pending.completed {
                    warn!(call_id = %pending.call_id, "Function call ended before its arguments");
                    continue;
                }
                info!(call_id = %pending.call_id, tool = %pending.function_name, "Dispatching tool call");
                if let Err(e) = ctx.tools.dispatch(ctx.client.as_ref(), pending).await {
                    warn!(error = %e, "Failed to report tool output");
                }
            }
        }
    }

    let response_id = response.id.clone();
    let outcome = response.finish().await;
    if outcome.status == ResponseStatus::Failed {
        let details = outcome
            .status_details
            .map(|details| details.to_string())
            .unwrap_or_else(|| "null".to_string());
        debug!(response_id = %response_id, "Response reported failure");
        ctx.transcript
            .push_error(format!("Response failed: {}", details));
        return Err(SessionError::ResponseFailure(details));
    }
    Ok(())
}

async fn handle_message(ctx: &DispatchContext, mut message: MessageItem) {
    let mut writer = ctx.transcript.begin_assistant();
    let mut text = String::new();

    while let Some(part) = message.content.recv().await {
        match part {
            ContentPart::Text(deltas) => {
                append_deltas(&mut writer, &mut text, deltas).await;
            }
            ContentPart::Audio(AudioPart { transcript, audio }) => {
                tokio::join!(
                    append_deltas(&mut writer, &mut text, transcript),
                    play_audio(&ctx.player, &ctx.activity, audio),
                );
            }
        }
    }
    debug!(item_id = %message.id, chars = text.len(), "Assistant message complete");
}

async fn append_deltas(
    writer: &mut AssistantMessageWriter,
    text: &mut String,
    mut deltas: mpsc::Receiver<String>,
) {
    while let Some(delta) = deltas.recv().await {
        writer.append(&delta);
        text.push_str(&delta);
    }
}

async fn play_audio(
    player: &StreamingPlayer,
    activity: &ActivitySignal,
    mut chunks: mpsc::Receiver<Vec<u8>>,
) {
    player.start();
    while let Some(chunk) = chunks.recv().await {
        player.play_chunk(chunk);
        activity.update(Activity::AgentSpeaking);
    }
}

/// Barge-in: halt assistant audio, wait for the transcription, record the user turn.
pub(crate) async fn handle_input_audio(
    transcript: &Transcript,
    activity: &ActivitySignal,
    player: &StreamingPlayer,
    item: InputAudioItem,
) {
    activity.update(Activity::UserSpeaking);
    player.stop();
    let item_id = item.id.clone();
    let transcription = item.wait_for_completion().await;
    activity.update(Activity::Idle);
    debug!(item_id = %item_id, has_text = transcription.is_some(), "Input audio complete");
    transcript.push_user(transcription.unwrap_or_default());
}
