//! Encrypted credentials: `account.*`, `apikey.*`, `keychain.*`.
//!
//! Values are written through the store's cipher and never returned by
//! listings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use opta_protocol::Safety;

use super::{op, NoInput, OpContext, OperationError, OperationSpec};
use crate::store::{SecretEntry, NS_ACCOUNT, NS_APIKEY, NS_KEYCHAIN};

const ACCOUNT_USER: &str = "user";
const ACCOUNT_TOKEN: &str = "token";

pub(super) fn specs() -> Vec<OperationSpec> {
    vec![
        op(
            "account.status",
            "Account status",
            "Whether an account is signed in, and as whom.",
            Safety::Read,
            account_status,
        ),
        op(
            "account.login",
            "Sign in",
            "Store account credentials.",
            Safety::Write,
            account_login,
        ),
        op(
            "account.logout",
            "Sign out",
            "Forget stored account credentials.",
            Safety::Write,
            account_logout,
        ),
        op(
            "apikey.list",
            "List API keys",
            "Providers with a stored API key.",
            Safety::Read,
            apikey_list,
        ),
        op(
            "apikey.set",
            "Set API key",
            "Store the API key for a provider.",
            Safety::Write,
            apikey_set,
        ),
        op(
            "apikey.delete",
            "Delete API key",
            "Remove the stored API key for a provider.",
            Safety::Dangerous,
            apikey_delete,
        ),
        op(
            "keychain.set",
            "Set keychain item",
            "Store a named secret.",
            Safety::Write,
            keychain_set,
        ),
        op(
            "keychain.delete",
            "Delete keychain item",
            "Remove a named secret.",
            Safety::Dangerous,
            keychain_delete,
        ),
    ]
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountStatus {
    logged_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Login {
    user: String,
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ApiKeySet {
    provider: String,
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Provider {
    provider: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct KeychainSet {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct KeychainName {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Stored {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Removed {
    name: String,
    deleted: bool,
}

fn non_empty(field: &str, value: &str) -> Result<(), OperationError> {
    if value.trim().is_empty() {
        return Err(OperationError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

async fn account_status(ctx: Arc<OpContext>, _: NoInput) -> Result<AccountStatus, OperationError> {
    let (user, token) = ctx
        .store
        .run(|s| {
            Ok((
                s.secret_get(NS_ACCOUNT, ACCOUNT_USER)?,
                s.secret_get(NS_ACCOUNT, ACCOUNT_TOKEN)?,
            ))
        })
        .await?;
    Ok(AccountStatus {
        logged_in: token.is_some(),
        user: user.filter(|_| token.is_some()),
    })
}

async fn account_login(ctx: Arc<OpContext>, input: Login) -> Result<AccountStatus, OperationError> {
    non_empty("user", &input.user)?;
    non_empty("token", &input.token)?;
    let user = input.user.clone();
    ctx.store
        .run(move |s| {
            s.secret_set(NS_ACCOUNT, ACCOUNT_USER, &input.user)?;
            s.secret_set(NS_ACCOUNT, ACCOUNT_TOKEN, &input.token)
        })
        .await?;
    Ok(AccountStatus {
        logged_in: true,
        user: Some(user),
    })
}

async fn account_logout(ctx: Arc<OpContext>, _: NoInput) -> Result<AccountStatus, OperationError> {
    ctx.store
        .run(|s| {
            s.secret_delete(NS_ACCOUNT, ACCOUNT_TOKEN)?;
            s.secret_delete(NS_ACCOUNT, ACCOUNT_USER)
        })
        .await?;
    Ok(AccountStatus {
        logged_in: false,
        user: None,
    })
}

async fn apikey_list(ctx: Arc<OpContext>, _: NoInput) -> Result<Vec<SecretEntry>, OperationError> {
    Ok(ctx.store.run(|s| s.secret_list(NS_APIKEY)).await?)
}

async fn apikey_set(ctx: Arc<OpContext>, input: ApiKeySet) -> Result<Stored, OperationError> {
    non_empty("provider", &input.provider)?;
    non_empty("key", &input.key)?;
    let name = input.provider.clone();
    ctx.store
        .run(move |s| s.secret_set(NS_APIKEY, &input.provider, &input.key))
        .await?;
    Ok(Stored { name })
}

async fn apikey_delete(ctx: Arc<OpContext>, input: Provider) -> Result<Removed, OperationError> {
    let name = input.provider.clone();
    let deleted = ctx
        .store
        .run(move |s| s.secret_delete(NS_APIKEY, &input.provider))
        .await?;
    Ok(Removed { name, deleted })
}

async fn keychain_set(ctx: Arc<OpContext>, input: KeychainSet) -> Result<Stored, OperationError> {
    non_empty("name", &input.name)?;
    let name = input.name.clone();
    ctx.store
        .run(move |s| s.secret_set(NS_KEYCHAIN, &input.name, &input.value))
        .await?;
    Ok(Stored { name })
}

async fn keychain_delete(ctx: Arc<OpContext>, input: KeychainName) -> Result<Removed, OperationError> {
    let name = input.name.clone();
    let deleted = ctx
        .store
        .run(move |s| s.secret_delete(NS_KEYCHAIN, &input.name))
        .await?;
    Ok(Removed { name, deleted })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::tests::{call, call_confirmed, harness};
    use crate::store::{NS_APIKEY, NS_KEYCHAIN};

    #[tokio::test]
    async fn login_status_logout() {
        let h = harness();
        let status = call(&h, "account.status", json!({})).await.result.unwrap();
        assert_eq!(status, json!({"loggedIn": false}));

        let login = call(&h, "account.login", json!({"user": "ada", "token": "t-1"})).await;
        assert!(login.ok);
        let status = call(&h, "account.status", json!({})).await.result.unwrap();
        assert_eq!(status, json!({"loggedIn": true, "user": "ada"}));

        assert!(call(&h, "account.logout", json!({})).await.ok);
        assert!(call(&h, "account.logout", json!({})).await.ok);
        let status = call(&h, "account.status", json!({})).await.result.unwrap();
        assert_eq!(status["loggedIn"], false);
    }

    #[tokio::test]
    async fn api_keys_are_encrypted_and_never_listed() {
        let h = harness();
        call(&h, "apikey.set", json!({"provider": "anthropic", "key": "sk-secret"})).await;
        call(&h, "apikey.set", json!({"provider": "anthropic", "key": "sk-newer"})).await;

        let listed = call(&h, "apikey.list", json!({})).await.result.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert!(!listed.to_string().contains("sk-"));

        let store = h.executor.context().store.clone();
        let value = store
            .run(|s| s.secret_get(NS_APIKEY, "anthropic"))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("sk-newer"));
    }

    #[tokio::test]
    async fn keychain_set_and_confirmed_delete() {
        let h = harness();
        assert!(call(&h, "keychain.set", json!({"name": "github", "value": "ghp"})).await.ok);

        let refused = call(&h, "keychain.delete", json!({"name": "github"})).await;
        assert_eq!(refused.error_code(), Some("confirmation-required"));

        let deleted = call_confirmed(&h, "keychain.delete", json!({"name": "github"})).await;
        assert_eq!(deleted.result.unwrap()["deleted"], true);

        let store = h.executor.context().store.clone();
        let value = store
            .run(|s| s.secret_get(NS_KEYCHAIN, "github"))
            .await
            .unwrap();
        assert_eq!(value, None);
    }
}
