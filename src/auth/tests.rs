use super::*;
use axum::http::HeaderMap;
use serde_json::json;

fn headers(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("authorization", value.parse().unwrap());
    headers
}

mod extract_bearer_token_tests {
    use super::*;

    #[test]
    fn valid_bearer_token() {
        let result = extract_bearer_token(&headers("Bearer user-42"));
        assert_eq!(result, Ok("user-42".to_string()));
    }

    #[test]
    fn valid_bearer_token_with_extra_whitespace() {
        let result = extract_bearer_token(&headers("Bearer   user-42  "));
        assert_eq!(result, Ok("user-42".to_string()));
    }

    #[test]
    fn case_insensitive_bearer() {
        let result = extract_bearer_token(&headers("bEaReR user-42"));
        assert_eq!(result, Ok("user-42".to_string()));
    }

    #[test]
    fn missing_authorization_header() {
        let result = extract_bearer_token(&HeaderMap::new());
        assert_eq!(result, Err(TokenError::Missing));
    }

    #[test]
    fn empty_authorization_header() {
        assert_eq!(extract_bearer_token(&headers("")), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn wrong_auth_scheme() {
        let result = extract_bearer_token(&headers("Basic dXNlcjpwYXNz"));
        assert_eq!(result, Err(TokenError::InvalidFormat));
    }

    #[test]
    fn bearer_without_token() {
        assert_eq!(extract_bearer_token(&headers("Bearer")), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn bearer_with_empty_token() {
        assert_eq!(extract_bearer_token(&headers("Bearer  ")), Err(TokenError::Empty));
    }

    #[test]
    fn error_messages() {
        assert_eq!(TokenError::Missing.to_string(), "Authorization token not provided");
        assert_eq!(TokenError::Empty.to_string(), "Authorization token is empty");
    }
}

mod token_issuer_tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    fn issuer() -> TokenIssuer {
        TokenIssuer::new("test-signing-secret", "linkhub", 3600).unwrap()
    }

    fn is_base64url(segment: &str) -> bool {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    #[test]
    fn token_shape() {
        let issued = issuer().generate("u1", "gmail", json!({})).unwrap();

        assert!(issued.token.len() > 100, "token too short: {}", issued.token.len());
        let segments: Vec<&str> = issued.token.split('.').collect();
        assert_eq!(segments.len(), 3);
        assert!(segments.iter().all(|s| is_base64url(s)));
        assert_eq!(issued.expires_in, 3600);

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segments[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "HS256");
    }

    #[test]
    fn different_users_get_different_tokens() {
        let issuer = issuer();
        let a = issuer.generate("alice", "gmail", json!({})).unwrap();
        let b = issuer.generate("bob", "gmail", json!({})).unwrap();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn repeated_issuance_is_unique() {
        let issuer = issuer();
        let a = issuer.generate("alice", "gmail", json!({})).unwrap();
        let b = issuer.generate("alice", "gmail", json!({})).unwrap();
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn verify_round_trip() {
        let issuer = issuer();
        let issued = issuer
            .generate("u1", "slack", json!({"redirect": "app://done"}))
            .unwrap();

        let claims = issuer.verify(&issued.token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.connector, "slack");
        assert_eq!(claims.iss, "linkhub");
        assert_eq!(claims.metadata["redirect"], "app://done");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[test]
    fn verify_rejects_tampering() {
        let issuer = issuer();
        let issued = issuer.generate("u1", "gmail", json!({})).unwrap();
        let other = issuer.generate("u2", "gmail", json!({})).unwrap();

        let mut parts: Vec<&str> = issued.token.split('.').collect();
        let forged_claims = other.token.split('.').nth(1).unwrap();
        parts[1] = forged_claims;
        assert!(issuer.verify(&parts.join(".")).is_err());

        assert!(issuer.verify("not.a.token").is_err());
        assert!(issuer.verify("only.two").is_err());
    }

    #[test]
    fn verify_rejects_other_secret() {
        let issued = issuer().generate("u1", "gmail", json!({})).unwrap();
        let other = TokenIssuer::new("different-secret", "linkhub", 3600).unwrap();
        assert!(other.verify(&issued.token).is_err());
    }

    #[test]
    fn rejects_bad_input() {
        let issuer = issuer();
        assert!(issuer.generate("", "gmail", json!({})).is_err());
        assert!(issuer.generate("u1", " ", json!({})).is_err());
        assert!(issuer.generate("u1", "gmail", json!([1])).is_err());
        assert!(issuer.generate("u1", "gmail", serde_json::Value::Null).is_ok());
    }

    #[test]
    fn rejects_empty_secret() {
        assert!(TokenIssuer::new("", "linkhub", 3600).is_err());
    }
}
