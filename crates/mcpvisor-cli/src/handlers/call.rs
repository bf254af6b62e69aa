//! Call command handler.

use anyhow::Result;
use serde_json::Value;

use crate::bootstrap::CliContext;
use crate::error::CliError;

/// Start only `server`, invoke `tool` with `args`, print the result payload.
pub async fn execute(ctx: &CliContext, server: &str, tool: &str, args: Option<&str>) -> Result<()> {
    let arguments = parse_arguments(args)?;

    let config = ctx
        .store
        .snapshot()
        .get_enabled(server)
        .cloned()
        .ok_or_else(|| CliError::Config(format!("server '{server}' is not configured or is disabled")))?;

    let outcome = call(ctx, server, config, tool, arguments).await;
    ctx.supervisor.shutdown().await;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn call(
    ctx: &CliContext,
    server: &str,
    config: mcpvisor_core::ServerConfig,
    tool: &str,
    arguments: Value,
) -> Result<Value, CliError> {
    ctx.supervisor.start_server(server, config).await?;
    Ok(ctx.supervisor.call_tool(server, tool, arguments).await?)
}

/// Tool arguments must be a JSON object; absent means `{}`.
fn parse_arguments(args: Option<&str>) -> Result<Value, CliError> {
    let Some(text) = args else {
        return Ok(Value::Object(serde_json::Map::new()));
    };
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(CliError::Arguments(
            "--args must be a JSON object".to_string(),
        )),
        Err(e) => Err(CliError::Arguments(format!("--args is not valid JSON: {e}"))),
    }
}
