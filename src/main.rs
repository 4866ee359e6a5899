//! triage - 支持工单智能体
//!
//! 入口：初始化日志与配置，读取一条用户消息（命令行参数或 stdin），跑一次 ReAct 并以 JSON 输出回复。
//! 可选环境变量 TRIAGE_CONFIG 指定额外配置文件。

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use triage::config::load_config;
use triage::{observability, Agent, AgentRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::var("TRIAGE_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let message = if args.is_empty() {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read message from stdin")?;
        buf
    } else {
        args.join(" ")
    };
    if message.trim().is_empty() {
        anyhow::bail!("usage: triage <message>  (or pipe the message on stdin)");
    }

    let agent = Agent::from_config(&cfg).context("Failed to create agent")?;
    let request = AgentRequest::message(uuid::Uuid::new_v4().to_string(), message);
    let reply = agent.handle(request).await.context("Request failed")?;

    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}
