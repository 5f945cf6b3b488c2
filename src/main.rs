//! Council 演示程序
//!
//! 用法：`council "<输入>" ["<输入>" ...]`
//! 每条输入在同一会话中依次处理，结果以 JSON 输出到 stdout。
//! [llm].provider = "openai" 时走 OpenAI 兼容接口，否则使用内置脚本化服务。

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;

use council::capability::{CapabilityDescriptor, CapabilityRole};
use council::config::{load_config, AppConfig};
use council::core::{
    run_until_shutdown, BackgroundTasksCleanup, CouncilContext, MemorySnapshotCleanup,
    ShutdownCoordinator, ShutdownManager,
};
use council::llm::{LlmReasoningService, OpenAiClient, ReasoningService, ScriptedService};
use council::memory::MemoryPersistence;
use council::observability;

/// 演示用脚本：按角色给出固定回答
fn demo_service(capabilities: &[CapabilityDescriptor]) -> ScriptedService {
    capabilities
        .iter()
        .enumerate()
        .fold(ScriptedService::new(), |service, (i, d)| {
            let (answer, confidence) = match d.role {
                CapabilityRole::Triage => (json!({"urgency": "medium", "rationale": ["persistent symptoms"]}), 85.0),
                CapabilityRole::Diagnosis => (
                    json!({"primary": "tension headache", "differentials": ["migraine"]}),
                    90.0 - 5.0 * i as f64,
                ),
                CapabilityRole::Treatment => (json!({"plan": ["rest", "hydration"], "cautions": []}), 80.0),
                CapabilityRole::RiskAssessment => (json!({"level": "low", "factors": []}), 75.0),
                CapabilityRole::General => (json!({"summary": "follow up in one week"}), 70.0),
            };
            service.reply(&d.id, answer, confidence)
        })
}

fn reasoning_service(config: &AppConfig) -> Arc<dyn ReasoningService> {
    match config.llm.provider.as_str() {
        "openai" => {
            tracing::info!(model = %config.llm.model, "Using OpenAI-compatible reasoning service");
            let client = Arc::new(OpenAiClient::from_section(&config.llm));
            Arc::new(LlmReasoningService::new(client))
        }
        other => {
            if other != "mock" {
                tracing::warn!(provider = %other, "Unknown provider, falling back to scripted demo service");
            }
            Arc::new(demo_service(&config.capabilities.0))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let inputs: Vec<String> = std::env::args().skip(1).collect();
    if inputs.is_empty() {
        eprintln!("usage: council \"<input>\" [\"<input>\" ...]");
        return Ok(());
    }

    let config = load_config(None).context("Failed to load config")?;
    let persistence = config.app.memory_snapshot.clone().map(MemoryPersistence::new);

    let mut builder =
        CouncilContext::builder(reasoning_service(&config)).with_config(config.clone());
    if let Some(p) = &persistence {
        if let Some(snapshot) = p.load().context("Failed to load memory snapshot")? {
            builder = builder.with_memory_snapshot(snapshot);
        }
    }
    let ctx = builder.build().context("Failed to build council context")?;
    ctx.start_background();

    let manager = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new(manager.clone());
    coordinator.register(BackgroundTasksCleanup::new(ctx.clone()));
    if let Some(p) = persistence {
        coordinator.register(MemorySnapshotCleanup::new(ctx.memory().clone(), p));
    }

    let session = ctx.session();
    let app = async {
        for input in &inputs {
            let outcome = session.process(input).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        anyhow::Ok(())
    };
    let outcome = run_until_shutdown(manager, app).await;
    if outcome.is_none() {
        session.cancel();
    }

    coordinator.run_cleanup().await;
    match outcome {
        Some(result) => result,
        None => Ok(()),
    }
}
