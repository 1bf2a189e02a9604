//! `env.profiles.*` and `config.*`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use opta_protocol::Safety;

use super::{op, NoInput, OpContext, OperationError, OperationSpec};
use crate::store::EnvProfile;

pub(super) fn specs() -> Vec<OperationSpec> {
    vec![
        op(
            "env.profiles.list",
            "List environment profiles",
            "All saved environment profiles and which one is active.",
            Safety::Read,
            profiles_list,
        ),
        op(
            "env.profiles.save",
            "Save environment profile",
            "Create or replace a named set of environment variables.",
            Safety::Write,
            profiles_save,
        ),
        op(
            "env.profiles.activate",
            "Activate environment profile",
            "Make one profile the active one.",
            Safety::Write,
            profiles_activate,
        ),
        op(
            "env.profiles.delete",
            "Delete environment profile",
            "Remove a saved profile.",
            Safety::Dangerous,
            profiles_delete,
        ),
        op(
            "config.get",
            "Get config value",
            "Read one stored configuration value.",
            Safety::Read,
            config_get,
        ),
        op(
            "config.set",
            "Set config value",
            "Store a configuration value.",
            Safety::Write,
            config_set,
        ),
        op(
            "config.list",
            "List config",
            "Every stored configuration value.",
            Safety::Read,
            config_list,
        ),
    ]
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ProfileName {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ProfileSave {
    name: String,
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Deleted {
    name: String,
    deleted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigKey {
    key: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigEntry {
    key: String,
    value: Value,
}

fn require_name(field: &str, value: &str) -> Result<(), OperationError> {
    if value.trim().is_empty() {
        return Err(OperationError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

async fn profiles_list(ctx: Arc<OpContext>, _: NoInput) -> Result<Vec<EnvProfile>, OperationError> {
    Ok(ctx.store.run(|s| s.profiles_list()).await?)
}

async fn profiles_save(ctx: Arc<OpContext>, input: ProfileSave) -> Result<EnvProfile, OperationError> {
    require_name("name", &input.name)?;
    if let Some(bad) = input.variables.keys().find(|k| k.is_empty() || k.contains('=')) {
        return Err(OperationError::InvalidInput(format!(
            "invalid variable name `{bad}`"
        )));
    }
    Ok(ctx
        .store
        .run(move |s| s.profile_save(&input.name, &input.variables))
        .await?)
}

async fn profiles_activate(ctx: Arc<OpContext>, input: ProfileName) -> Result<EnvProfile, OperationError> {
    let name = input.name.clone();
    ctx.store.run(move |s| s.profile_activate(&input.name)).await?;
    let profiles = ctx.store.run(|s| s.profiles_list()).await?;
    profiles
        .into_iter()
        .find(|p| p.name == name)
        .ok_or_else(|| OperationError::NotFound(format!("profile `{name}`")))
}

async fn profiles_delete(ctx: Arc<OpContext>, input: ProfileName) -> Result<Deleted, OperationError> {
    let name = input.name.clone();
    let deleted = ctx.store.run(move |s| s.profile_delete(&input.name)).await?;
    Ok(Deleted { name, deleted })
}

async fn config_get(ctx: Arc<OpContext>, input: ConfigKey) -> Result<ConfigEntry, OperationError> {
    let key = input.key.clone();
    let value = ctx.store.run(move |s| s.config_get(&input.key)).await?;
    Ok(ConfigEntry {
        key,
        value: value.unwrap_or(Value::Null),
    })
}

async fn config_set(ctx: Arc<OpContext>, input: ConfigEntry) -> Result<ConfigEntry, OperationError> {
    require_name("key", &input.key)?;
    if input.value.is_null() {
        return Err(OperationError::InvalidInput("value must not be null".into()));
    }
    let ConfigEntry { key, value } = input;
    let stored = value.clone();
    let stored_key = key.clone();
    ctx.store
        .run(move |s| s.config_set(&stored_key, &stored))
        .await?;
    Ok(ConfigEntry { key, value })
}

async fn config_list(
    ctx: Arc<OpContext>,
    _: NoInput,
) -> Result<BTreeMap<String, Value>, OperationError> {
    Ok(ctx.store.run(|s| s.config_list()).await?)
}
