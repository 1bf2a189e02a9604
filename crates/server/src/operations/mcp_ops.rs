//! `mcp.*`: MCP server registrations.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use opta_protocol::Safety;

use super::{op, NoInput, OpContext, OperationError, OperationSpec};
use crate::store::McpServer;

pub(super) fn specs() -> Vec<OperationSpec> {
    vec![
        op(
            "mcp.list",
            "List MCP servers",
            "Registered MCP servers.",
            Safety::Read,
            mcp_list,
        ),
        op(
            "mcp.add",
            "Add MCP server",
            "Register or replace an MCP server launch command.",
            Safety::Write,
            mcp_add,
        ),
        op(
            "mcp.remove",
            "Remove MCP server",
            "Unregister an MCP server.",
            Safety::Dangerous,
            mcp_remove,
        ),
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct McpAdd {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct McpName {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Removed {
    name: String,
    deleted: bool,
}

async fn mcp_list(ctx: Arc<OpContext>, _: NoInput) -> Result<Vec<McpServer>, OperationError> {
    Ok(ctx.store.run(|s| s.mcp_list()).await?)
}

async fn mcp_add(ctx: Arc<OpContext>, input: McpAdd) -> Result<McpServer, OperationError> {
    if input.name.trim().is_empty() || input.command.trim().is_empty() {
        return Err(OperationError::InvalidInput(
            "name and command must not be empty".into(),
        ));
    }
    let server = McpServer {
        name: input.name,
        command: input.command,
        args: input.args,
        env: input.env,
        enabled: input.enabled.unwrap_or(true),
    };
    let stored = server.clone();
    ctx.store.run(move |s| s.mcp_add(&stored)).await?;
    Ok(server)
}

async fn mcp_remove(ctx: Arc<OpContext>, input: McpName) -> Result<Removed, OperationError> {
    let name = input.name.clone();
    let deleted = ctx.store.run(move |s| s.mcp_remove(&input.name)).await?;
    Ok(Removed { name, deleted })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::tests::{call, call_confirmed, harness};

    #[tokio::test]
    async fn add_replace_and_remove() {
        let h = harness();
        let added = call(
            &h,
            "mcp.add",
            json!({"name": "fs", "command": "mcp-fs", "args": ["--root", "/tmp"]}),
        )
        .await;
        assert!(added.ok, "{:?}", added);
        assert_eq!(added.result.unwrap()["enabled"], true);

        call(
            &h,
            "mcp.add",
            json!({"name": "fs", "command": "mcp-fs2", "enabled": false}),
        )
        .await;
        let listed = call(&h, "mcp.list", json!({})).await.result.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["command"], "mcp-fs2");
        assert_eq!(listed[0]["enabled"], false);

        let removed = call_confirmed(&h, "mcp.remove", json!({"name": "fs"})).await;
        assert_eq!(removed.result.unwrap()["deleted"], true);
        let listed = call(&h, "mcp.list", json!({})).await.result.unwrap();
        assert!(listed.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_rejects_unknown_fields() {
        let h = harness();
        let response = call(
            &h,
            "mcp.add",
            json!({"name": "fs", "command": "x", "transport": "stdio"}),
        )
        .await;
        assert_eq!(response.error_code(), Some("invalid-input"));
    }
}
