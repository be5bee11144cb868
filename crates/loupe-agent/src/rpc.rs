use anyhow::Context;
use loupe_core::Result;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::Agent;
use crate::tools::ToolRegistry;

/// Minimal line-delimited JSON-RPC 2.0 loop over stdio: `ping`,
/// `tools.list`, `tools.call`. The full tool-call server protocol lives
/// outside this crate; this loop is the interface boundary.
pub async fn run_stdio(agent: &Agent, registry: &ToolRegistry) -> Result<()> {
    info!("starting stdio tool-call loop");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut lines = stdin.lines();

    while let Some(line) = lines.next_line().await.context("failed reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        debug!("received: {line}");

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(agent, registry, request).await,
            Err(err) => respond(None, Err(Fault::Parse(err.to_string()))),
        };

        let payload = response.to_string();
        stdout
            .write_all(payload.as_bytes())
            .await
            .context("failed writing stdout")?;
        stdout.write_all(b"\n").await.context("failed writing stdout")?;
        stdout.flush().await.context("failed flushing stdout")?;
    }

    info!("stdio loop terminated");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

/// Transport-level failures, as opposed to tool outcomes (which travel
/// inside a successful response). Codes are the JSON-RPC 2.0 constants.
#[derive(Debug)]
enum Fault {
    Parse(String),
    UnknownMethod(String),
    BadParams(&'static str),
}

impl Fault {
    fn code(&self) -> i64 {
        match self {
            Fault::Parse(_) => -32700,
            Fault::UnknownMethod(_) => -32601,
            Fault::BadParams(_) => -32602,
        }
    }

    fn message(&self) -> String {
        match self {
            Fault::Parse(detail) => format!("unparseable request: {detail}"),
            Fault::UnknownMethod(method) => format!("no such method: {method}"),
            Fault::BadParams(detail) => format!("bad params: {detail}"),
        }
    }
}

fn respond(id: Option<Value>, payload: std::result::Result<Value, Fault>) -> Value {
    match payload {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(fault) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": fault.code(), "message": fault.message() }
        }),
    }
}

async fn handle_request(agent: &Agent, registry: &ToolRegistry, request: Request) -> Value {
    let payload = match request.method.as_str() {
        "ping" => Ok(json!({ "pong": true })),
        "tools.list" => Ok(json!({ "tools": registry.descriptors() })),
        "tools.call" => call_tool(agent, registry, &request.params).await,
        other => Err(Fault::UnknownMethod(other.to_string())),
    };
    respond(request.id, payload)
}

async fn call_tool(
    agent: &Agent,
    registry: &ToolRegistry,
    params: &Value,
) -> std::result::Result<Value, Fault> {
    let Some(tool) = params.get("tool").and_then(|t| t.as_str()) else {
        return Err(Fault::BadParams("tools.call takes a `tool` string"));
    };
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let outcome = registry.dispatch(agent, tool, arguments).await;
    Ok(json!({ "tool": tool, "result": outcome }))
}
