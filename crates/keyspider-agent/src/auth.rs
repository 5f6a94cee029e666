//! Bearer token verification for agent requests.

use axum::http::{HeaderMap, StatusCode};
use keyspider_core::types::AgentStatus;
use keyspider_store::Store;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// SHA256 of a token, lowercase hex. This is all the server ever stores.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Extract the bearer token from the Authorization header.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get("Authorization")?.to_str().ok()?;
    if value.len() > 7 && value[..7].eq_ignore_ascii_case("Bearer ") {
        Some(&value[7..])
    } else {
        None
    }
}

/// Resolve the agent for a request. Any failure is a plain 401 with no
/// retry guidance.
pub fn verify_agent(store: &Store, headers: &HeaderMap) -> Result<AgentStatus, StatusCode> {
    let token = bearer_token(headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let presented = hash_token(token);

    let agent = store
        .find_agent_by_token_hash(&presented)
        .map_err(|_| StatusCode::UNAUTHORIZED)?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // The lookup already matched on the hash; the explicit constant-time
    // comparison keeps the verification timing-independent.
    let matches: bool = agent
        .token_hash
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .into();
    if !matches {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(agent)
}

#[cfg(test)]
mod tests {
    use keyspider_core::types::OsType;

    use super::*;

    #[test]
    fn hash_is_hex_and_stable() {
        let hash = hash_token("s3cret");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_token("s3cret"));
        assert_ne!(hash, hash_token("s3cret2"));
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", value.parse().unwrap());
        headers
    }

    #[test]
    fn verify_rejects_missing_and_unknown() {
        let store = Store::open_in_memory().unwrap();

        assert_eq!(
            verify_agent(&store, &HeaderMap::new()).unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            verify_agent(&store, &headers_with("Basic dXNlcg==")).unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            verify_agent(&store, &headers_with("Bearer nope")).unwrap_err(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn verify_accepts_registered_token() {
        let store = Store::open_in_memory().unwrap();
        let server = store
            .upsert_server("agenthost", "10.0.0.4", 22, OsType::Linux, Some("manual"))
            .unwrap();
        store
            .register_agent(server.id, &hash_token("s3cret"))
            .unwrap();

        let agent = verify_agent(&store, &headers_with("Bearer s3cret")).unwrap();
        assert_eq!(agent.server_id, server.id);

        // Case-insensitive scheme.
        assert!(verify_agent(&store, &headers_with("bearer s3cret")).is_ok());
    }
}
