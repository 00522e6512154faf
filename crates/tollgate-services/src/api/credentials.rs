//! Request credentials and client identity.

use std::collections::HashMap;

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, USER_AGENT};

use tollgate_llm::Credentials;
use tollgate_types::config::ProvidersConfig;
use tollgate_types::{ProviderKind, SecretString};

/// Client name used when the request carries no `User-Agent`.
pub const DEFAULT_CLIENT: &str = "default";

/// Client headers forwarded upstream unchanged, per provider.
fn forwarded_headers(kind: ProviderKind) -> &'static [&'static str] {
    match kind {
        ProviderKind::OpenAi => &["openai-organization", "openai-project"],
        ProviderKind::Anthropic => &["anthropic-beta"],
        ProviderKind::Gemini => &[],
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    let value = header(headers, AUTHORIZATION.as_str())?;
    let (scheme, token) = value.split_once(' ')?;
    (scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty()).then(|| token.trim())
}

/// The client's own provider key, if it sent one.
///
/// The provider's native location is checked first, then a bearer token.
pub fn client_api_key<'a>(
    kind: ProviderKind,
    headers: &'a HeaderMap,
    query: &'a HashMap<String, String>,
) -> Option<&'a str> {
    let native = match kind {
        ProviderKind::OpenAi => None,
        ProviderKind::Anthropic => header(headers, "x-api-key"),
        ProviderKind::Gemini => header(headers, "x-goog-api-key")
            .or_else(|| query.get("key").map(String::as_str).filter(|k| !k.is_empty())),
    };
    native.or_else(|| bearer(headers))
}

/// Credentials for the upstream call: the client's key, else the
/// configured fallback.
pub fn extract_credentials(
    kind: ProviderKind,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    providers: &ProvidersConfig,
) -> Credentials {
    let api_key = match client_api_key(kind, headers, query) {
        Some(key) => Some(SecretString::new(key)),
        None => providers.get(kind).resolve_api_key(kind),
    };
    let forwarded = forwarded_headers(kind)
        .iter()
        .filter_map(|name| header(headers, name).map(|v| ((*name).to_owned(), v.to_owned())))
        .collect();
    Credentials {
        api_key,
        headers: forwarded,
    }
}

/// First product token of the `User-Agent`, else [`DEFAULT_CLIENT`].
///
/// `claude-cli/1.0.3 (external, cli)` yields `claude-cli`.
pub fn client_name(headers: &HeaderMap) -> String {
    header(headers, USER_AGENT.as_str())
        .and_then(|ua| ua.split_whitespace().next())
        .and_then(|product| product.split('/').next())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_CLIENT)
        .to_owned()
}
