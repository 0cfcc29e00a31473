//! Bot command executor and the PTZ / stream control router.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};

use super::{TaskExecutor, TaskFailure};
use crate::database::models::{
    EVENT_BOT_ERROR, EVENT_BOT_EXECUTED, IntegrationTaskDbModel, TaskType,
};
use crate::database::repositories::EventRepository;
use crate::integration::payload::BotTaskPayload;

/// Errors a bot command can fail with.
#[derive(Debug, Error)]
pub enum BotCommandError {
    #[error("unsupported bot command: {0}")]
    Unsupported(String),

    #[error("invalid ptz params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),
}

impl BotCommandError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Failures are permanent when the command or its parameters are wrong.
fn is_permanent(message: &str) -> bool {
    message.contains("unsupported bot command") || message.contains("invalid ptz params")
}

/// Low-level bot command interface.
#[async_trait]
pub trait BotCommandRunner: Send + Sync {
    /// Run `command` for `provider`. The returned value is recorded with the
    /// `bot.command.executed` event.
    async fn run(
        &self,
        provider: &str,
        command: &str,
        params: &Value,
    ) -> std::result::Result<Value, BotCommandError>;
}

/// Pan/tilt/zoom camera control.
#[async_trait]
pub trait PtzCommander: Send + Sync {
    /// `pan` and `tilt` are in `-1.0..=1.0`, `speed` in `0.0..=1.0`.
    async fn move_camera(&self, pan: f64, tilt: f64, speed: f64)
    -> Result<(), BotCommandError>;
    async fn zoom(&self, delta: f64) -> Result<(), BotCommandError>;
    async fn goto_preset(&self, preset: u32) -> Result<(), BotCommandError>;
    async fn stop(&self) -> Result<(), BotCommandError>;
}

/// Control over the outgoing stream process.
#[async_trait]
pub trait StreamController: Send + Sync {
    async fn start_stream(&self) -> Result<(), BotCommandError>;
    async fn stop_stream(&self) -> Result<(), BotCommandError>;
    async fn restart_stream(&self) -> Result<(), BotCommandError>;
}

/// Ends the live session on the platform side.
#[async_trait]
pub trait LiveStopper: Send + Sync {
    async fn stop_live(&self, reason: &str) -> Result<(), BotCommandError>;
}

#[derive(Debug, Deserialize)]
struct MoveParams {
    #[serde(default)]
    pan: f64,
    #[serde(default)]
    tilt: f64,
    speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ZoomParams {
    delta: f64,
}

#[derive(Debug, Deserialize)]
struct PresetParams {
    preset: u32,
}

#[derive(Debug, Default, Deserialize)]
struct LiveStopParams {
    #[serde(default)]
    reason: String,
}

const DEFAULT_PTZ_SPEED: f64 = 0.5;
const MAX_PTZ_PRESET: u32 = 255;

fn ptz_params<T: for<'de> Deserialize<'de>>(params: &Value) -> Result<T, BotCommandError> {
    serde_json::from_value(params.clone()).map_err(|e| BotCommandError::InvalidParams(e.to_string()))
}

fn unit_range(name: &str, value: f64, min: f64) -> Result<f64, BotCommandError> {
    if !value.is_finite() || value < min || value > 1.0 {
        return Err(BotCommandError::InvalidParams(format!(
            "{name} must be within {min}..=1, got {value}"
        )));
    }
    Ok(value)
}

/// Routes `ptz.*`, `stream.*` and `live.*` commands to their controllers.
pub struct PtzBotExecutor {
    ptz: Arc<dyn PtzCommander>,
    stream: Arc<dyn StreamController>,
    live: Arc<dyn LiveStopper>,
}

impl PtzBotExecutor {
    pub fn new(
        ptz: Arc<dyn PtzCommander>,
        stream: Arc<dyn StreamController>,
        live: Arc<dyn LiveStopper>,
    ) -> Self {
        Self { ptz, stream, live }
    }
}

#[async_trait]
impl BotCommandRunner for PtzBotExecutor {
    async fn run(
        &self,
        _provider: &str,
        command: &str,
        params: &Value,
    ) -> std::result::Result<Value, BotCommandError> {
        match command.trim().to_ascii_lowercase().as_str() {
            "ptz.move" => {
                let p: MoveParams = ptz_params(params)?;
                let pan = unit_range("pan", p.pan, -1.0)?;
                let tilt = unit_range("tilt", p.tilt, -1.0)?;
                let speed = unit_range("speed", p.speed.unwrap_or(DEFAULT_PTZ_SPEED), 0.0)?;
                self.ptz.move_camera(pan, tilt, speed).await?;
                Ok(json!({ "pan": pan, "tilt": tilt, "speed": speed }))
            }
            "ptz.zoom" => {
                let p: ZoomParams = ptz_params(params)?;
                let delta = unit_range("delta", p.delta, -1.0)?;
                self.ptz.zoom(delta).await?;
                Ok(json!({ "delta": delta }))
            }
            "ptz.preset" => {
                let p: PresetParams = ptz_params(params)?;
                if p.preset == 0 || p.preset > MAX_PTZ_PRESET {
                    return Err(BotCommandError::InvalidParams(format!(
                        "preset must be within 1..={MAX_PTZ_PRESET}, got {}",
                        p.preset
                    )));
                }
                self.ptz.goto_preset(p.preset).await?;
                Ok(json!({ "preset": p.preset }))
            }
            "ptz.stop" => {
                self.ptz.stop().await?;
                Ok(json!({}))
            }
            "stream.start" => {
                self.stream.start_stream().await?;
                Ok(json!({}))
            }
            "stream.stop" => {
                self.stream.stop_stream().await?;
                Ok(json!({}))
            }
            "stream.restart" => {
                self.stream.restart_stream().await?;
                Ok(json!({}))
            }
            "live.stop" => {
                let p: LiveStopParams = serde_json::from_value(params.clone()).unwrap_or_default();
                self.live.stop_live(&p.reason).await?;
                Ok(json!({ "reason": p.reason }))
            }
            _ => Err(BotCommandError::Unsupported(command.to_string())),
        }
    }
}

/// Controller that only records commands in the log.
///
/// Used when no camera or encoder is attached to this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyController;

#[async_trait]
impl PtzCommander for LogOnlyController {
    async fn move_camera(
        &self,
        pan: f64,
        tilt: f64,
        speed: f64,
    ) -> Result<(), BotCommandError> {
        info!(pan, tilt, speed, "PTZ move");
        Ok(())
    }

    async fn zoom(&self, delta: f64) -> Result<(), BotCommandError> {
        info!(delta, "PTZ zoom");
        Ok(())
    }

    async fn goto_preset(&self, preset: u32) -> Result<(), BotCommandError> {
        info!(preset, "PTZ preset");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BotCommandError> {
        info!("PTZ stop");
        Ok(())
    }
}

#[async_trait]
impl StreamController for LogOnlyController {
    async fn start_stream(&self) -> Result<(), BotCommandError> {
        info!("Stream start requested");
        Ok(())
    }

    async fn stop_stream(&self) -> Result<(), BotCommandError> {
        info!("Stream stop requested");
        Ok(())
    }

    async fn restart_stream(&self) -> Result<(), BotCommandError> {
        info!("Stream restart requested");
        Ok(())
    }
}

#[async_trait]
impl LiveStopper for LogOnlyController {
    async fn stop_live(&self, reason: &str) -> Result<(), BotCommandError> {
        info!(reason, "Live stop requested");
        Ok(())
    }
}

/// Task executor for `bot` tasks.
pub struct BotExecutor {
    runner: Arc<dyn BotCommandRunner>,
    events: Arc<dyn EventRepository>,
}

impl BotExecutor {
    pub fn new(runner: Arc<dyn BotCommandRunner>, events: Arc<dyn EventRepository>) -> Self {
        Self { runner, events }
    }

    async fn emit(&self, event_type: &str, payload: Value) {
        if let Err(e) = self
            .events
            .create_live_event(event_type, &payload.to_string())
            .await
        {
            warn!(event_type, error = %e, "Failed to record bot event");
        }
    }
}

#[async_trait]
impl TaskExecutor for BotExecutor {
    fn task_type(&self) -> TaskType {
        TaskType::Bot
    }

    async fn execute(
        &self,
        task: &IntegrationTaskDbModel,
        attempt: i64,
    ) -> std::result::Result<(), TaskFailure> {
        let payload: BotTaskPayload = serde_json::from_str(&task.payload)
            .map_err(|e| TaskFailure::permanent(format!("invalid bot payload: {e}")))?;
        let params = payload
            .params_value()
            .map_err(|e| TaskFailure::permanent(format!("invalid bot params: {e}")))?;

        match self
            .runner
            .run(&payload.provider, &payload.command, &params)
            .await
        {
            Ok(result) => {
                info!(
                    task_id = task.id,
                    provider = %payload.provider,
                    command = %payload.command,
                    "Bot command executed"
                );
                self.emit(
                    EVENT_BOT_EXECUTED,
                    json!({
                        "taskId": task.id,
                        "provider": payload.provider,
                        "command": payload.command,
                        "attempt": attempt,
                        "result": result,
                    }),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    task_id = task.id,
                    command = %payload.command,
                    error = %message,
                    "Bot command failed"
                );
                self.emit(
                    EVENT_BOT_ERROR,
                    json!({
                        "taskId": task.id,
                        "provider": payload.provider,
                        "command": payload.command,
                        "attempt": attempt,
                        "error": message,
                    }),
                )
                .await;
                Err(TaskFailure {
                    retryable: !is_permanent(&message),
                    message,
                })
            }
        }
    }
}
