//! Integration tests for the gateway: admission, authentication fallback,
//! token lifecycle, and circuit breaking composed end to end.

#[cfg(test)]
mod gateway_tests {
    use scm_gateway::auth::MockStrategy;
    use scm_gateway::config::{BreakerConfig, RateLimiterConfig, TokenStoreConfig};
    use scm_gateway::token::AccessTokenRecord;
    use scm_gateway::{
        AuthMethod, AuthStrategy, AuthUser, Credential, Gateway, GatewayConfig, GatewayErrorKind,
        RateLimitKey,
    };
    use secrecy::SecretString;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn fast_breaker() -> BreakerConfig {
        BreakerConfig {
            timeout: Duration::from_millis(10),
            error_threshold_percentage: 50,
            reset_timeout: Duration::from_millis(50),
            volume_threshold: 1,
            rolling_count_timeout: Duration::from_secs(10),
            rolling_count_buckets: 10,
        }
    }

    fn local_key(user: &str) -> RateLimitKey {
        RateLimitKey::new(IpAddr::V4(Ipv4Addr::LOCALHOST), user)
    }

    fn jane() -> AuthUser {
        AuthUser::new("123", "Jane Admin")
    }

    /// Gateway authenticating bearer tokens, with a tight rate limit and a
    /// fast-tripping breaker.
    fn build_gateway(max_requests: u32) -> (Gateway<String>, Arc<MockStrategy>) {
        let strategy = Arc::new(MockStrategy::new().accept("b-token", jane()));
        let mut strategies: HashMap<AuthMethod, Arc<dyn AuthStrategy>> = HashMap::new();
        strategies.insert(AuthMethod::Bearer, strategy.clone());

        let config = GatewayConfig::builder()
            .priority(vec![AuthMethod::OAuth2, AuthMethod::Bearer])
            .rate_limit(RateLimiterConfig {
                max: max_requests,
                window: Duration::from_millis(100),
            })
            .circuit_breaker(fast_breaker())
            .build()
            .unwrap();

        (Gateway::new(config, strategies).unwrap(), strategy)
    }

    fn bearer_credentials() -> HashMap<AuthMethod, Credential> {
        let mut map = HashMap::new();
        map.insert(AuthMethod::Bearer, Credential::bearer("b-token"));
        map
    }

    #[tokio::test]
    async fn test_two_requests_within_window_second_rejected_429() {
        let (gateway, _) = build_gateway(1);
        let key = local_key("user-1");

        let first = gateway
            .execute(&key, &bearer_credentials(), |_| async {
                Ok("ok".to_string())
            })
            .await;
        assert!(first.is_ok());

        let second = gateway
            .execute(&key, &bearer_credentials(), |_| async {
                Ok("ok".to_string())
            })
            .await;
        let error = second.err().unwrap();
        assert_eq!(error.kind(), GatewayErrorKind::RateLimitExceeded);
        assert_eq!(error.status_code(), Some(429));
    }

    #[tokio::test]
    async fn test_stored_token_authenticates_through_oauth2_strategy() {
        let (gateway, bearer) = build_gateway(10);

        gateway
            .token_store()
            .store_access_token(AccessTokenRecord::new(
                "issued-token",
                "user-42",
                vec!["api".to_string()],
                Duration::from_secs(60),
            ))
            .await
            .unwrap();

        let mut credentials = HashMap::new();
        credentials.insert(AuthMethod::OAuth2, Credential::oauth2("issued-token"));

        let response = gateway
            .execute(&local_key("user-42"), &credentials, |user| async move {
                Ok(user.id)
            })
            .await
            .unwrap();

        assert_eq!(response, "user-42");
        // OAuth2 succeeded first in priority order; bearer was never tried.
        assert_eq!(bearer.call_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_stored_token_falls_back_to_bearer() {
        let (gateway, bearer) = build_gateway(10);

        let mut record = AccessTokenRecord::new(
            "stale-token",
            "user-42",
            vec![],
            Duration::from_secs(60),
        );
        record.expires_at = record.issued_at + chrono::Duration::milliseconds(1);
        gateway
            .token_store()
            .store_access_token(record)
            .await
            .unwrap();

        sleep(Duration::from_millis(10)).await;

        let mut credentials = bearer_credentials();
        credentials.insert(AuthMethod::OAuth2, Credential::oauth2("stale-token"));

        let response = gateway
            .execute(&local_key("user-42"), &credentials, |user| async move {
                Ok(user.name)
            })
            .await
            .unwrap();

        assert_eq!(response, "Jane Admin");
        assert_eq!(bearer.call_count(), 1);
        // The expired token was evicted during the failed oauth2 attempt.
        assert!(gateway
            .token_store()
            .get_access_token("stale-token")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_breaker_opens_and_recovers_through_gateway() {
        let (gateway, _) = build_gateway(100);
        let key = local_key("user-1");
        let calls = Arc::new(AtomicU32::new(0));

        let failing_calls = calls.clone();
        let error = gateway
            .execute(&key, &bearer_credentials(), |_| {
                let calls = failing_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<String, _>(scm_gateway::GatewayError::new(
                        GatewayErrorKind::ServiceUnavailable,
                        "502 from origin",
                    ))
                }
            })
            .await
            .err()
            .unwrap();
        assert_eq!(error.kind(), GatewayErrorKind::ServiceUnavailable);

        // Circuit is now open: rejected without invoking the transport.
        let blocked_calls = calls.clone();
        let error = gateway
            .execute(&key, &bearer_credentials(), |_| {
                let calls = blocked_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("should not run".to_string())
                }
            })
            .await
            .err()
            .unwrap();
        assert_eq!(error.kind(), GatewayErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // After the reset timeout the probe goes through and closes the
        // circuit again.
        sleep(Duration::from_millis(60)).await;
        let probe_calls = calls.clone();
        let response = gateway
            .execute(&key, &bearer_credentials(), |_| {
                let calls = probe_calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("recovered".to_string())
                }
            })
            .await
            .unwrap();
        assert_eq!(response, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let snapshot = gateway.metrics().snapshot();
        assert_eq!(snapshot.requests_total, 3);
        assert_eq!(snapshot.requests_success, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.requests_circuit_broken, 1);
    }

    #[tokio::test]
    async fn test_encrypted_store_round_trips_through_gateway() {
        let strategy: Arc<dyn AuthStrategy> = Arc::new(MockStrategy::new());
        let mut strategies = HashMap::new();
        strategies.insert(AuthMethod::Bearer, strategy);

        let config = GatewayConfig::builder()
            .priority(vec![AuthMethod::OAuth2])
            .token_store(TokenStoreConfig {
                encrypt_tokens: true,
                encryption_key: Some(SecretString::new("gateway-at-rest-key".to_string())),
                ..Default::default()
            })
            .build()
            .unwrap();
        let gateway: Gateway<String> = Gateway::new(config, strategies).unwrap();

        gateway
            .token_store()
            .store_access_token(AccessTokenRecord::new(
                "sealed-token",
                "user-7",
                vec!["repo".to_string()],
                Duration::from_secs(60),
            ))
            .await
            .unwrap();

        let fetched = gateway
            .token_store()
            .get_access_token("sealed-token")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.user_id, "user-7");
        assert_eq!(fetched.scopes, vec!["repo".to_string()]);

        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_identities_do_not_share_rate_limit_counters() {
        let (gateway, _) = build_gateway(1);

        for user in ["user-1", "user-2", "user-3"] {
            let response = gateway
                .execute(&local_key(user), &bearer_credentials(), |_| async {
                    Ok("ok".to_string())
                })
                .await;
            assert!(response.is_ok(), "first request for {} must pass", user);
        }
    }
}
