use anyhow::Result;
use phone_hands::agent::AdbDevice;
use phone_hands::model::{ModelClient, ModelConfig};
use phone_hands::sink::JsonlStepSink;
use phone_hands::stop::StopReason;
use phone_hands::{Agent, AdbConfig, AgentConfig, Language, StepSnapshot};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let task = std::env::args()
        .skip(1)
        .collect::<Vec<_>>()
        .join(" ");
    let task = if task.trim().is_empty() {
        "Open Settings and turn on dark mode".to_string()
    } else {
        task
    };

    let device_id = std::env::var("ANDROID_SERIAL").ok();
    let device = AdbDevice::new(AdbConfig {
        device_id: device_id.clone(),
        ..Default::default()
    })
    .with_frame_dir(std::env::temp_dir().join("phone_hands_frames"))
    .with_confirmation(Arc::new(|msg: &str| {
        eprintln!("Auto-approving sensitive action: {msg}");
        true
    }));

    let model = ModelClient::new(ModelConfig::default())?;
    let cfg = AgentConfig {
        max_steps: 40,
        device_id,
        lang: Language::En,
        record_script: true,
        track_steps: true,
        ..Default::default()
    };
    // Device is both the screen and the hands.
    let hands = device.clone();
    let mut agent = Agent::new(device, hands, model, cfg)?
        .with_step_sink(Arc::new(JsonlStepSink::new("backup/steps.jsonl")))
        .with_step_callback(Arc::new(|snap: &StepSnapshot| {
            println!(
                "step {}: {} -> {}",
                snap.step_number,
                snap.action,
                if snap.success { "ok" } else { "failed" }
            );
        }));

    let stop = agent.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop(StopReason::UserRequest, Some("Interrupted".into()));
        }
    });

    let message = agent.run(&task).await?;
    println!("{message}");
    if let Some(summary) = agent.script_summary() {
        println!("{summary}");
    }
    if let Some(stats) = agent.model().performance_stats(24) {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}
