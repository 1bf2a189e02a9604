//! `embeddings.create` and `rerank.run`, proxied to the LMX HTTP API.

use std::sync::Arc;

use serde::Deserialize;

use opta_connector_lmx::{EmbeddingsResponse, LmxHttpClient, RerankResponse};
use opta_protocol::Safety;

use super::{op, OpContext, OperationError, OperationSpec};

pub(super) fn specs() -> Vec<OperationSpec> {
    vec![
        op(
            "embeddings.create",
            "Create embeddings",
            "Embed one or more strings with a model served by LMX.",
            Safety::Read,
            embeddings_create,
        ),
        op(
            "rerank.run",
            "Rerank documents",
            "Order documents by relevance to a query using an LMX reranker.",
            Safety::Read,
            rerank_run,
        ),
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Embed {
    #[serde(default)]
    model: Option<String>,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Rerank {
    #[serde(default)]
    model: Option<String>,
    query: String,
    documents: Vec<String>,
    #[serde(default)]
    top_n: Option<usize>,
}

fn client(ctx: &OpContext) -> Result<&LmxHttpClient, OperationError> {
    ctx.lmx
        .as_ref()
        .ok_or_else(|| OperationError::Unavailable("LMX HTTP endpoint is not configured".into()))
}

fn model_or_default(ctx: &OpContext, model: Option<String>) -> String {
    model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| ctx.config.backend.default_model.clone())
}

async fn embeddings_create(
    ctx: Arc<OpContext>,
    input: Embed,
) -> Result<EmbeddingsResponse, OperationError> {
    if input.input.is_empty() {
        return Err(OperationError::InvalidInput("input must not be empty".into()));
    }
    let lmx = client(&ctx)?;
    let model = model_or_default(&ctx, input.model);
    Ok(lmx.embeddings(&model, &input.input).await?)
}

async fn rerank_run(ctx: Arc<OpContext>, input: Rerank) -> Result<RerankResponse, OperationError> {
    if input.query.trim().is_empty() || input.documents.is_empty() {
        return Err(OperationError::InvalidInput(
            "query and documents must not be empty".into(),
        ));
    }
    let lmx = client(&ctx)?;
    let model = model_or_default(&ctx, input.model);
    Ok(lmx
        .rerank(&model, &input.query, &input.documents, input.top_n)
        .await?)
}
