//! Request rate limiting built atop `governor`.
//!
//! One limiter per interceptor instance, either shared by every caller of
//! the proxy or keyed by client IP or a header value. Requests over the
//! quota are answered directly with the configured status.
use std::{
    net::IpAddr,
    num::NonZeroU32,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};
use http::{HeaderName, StatusCode};

use crate::{
    config::{MissingKeyPolicy, RateLimitBy, RateLimitConfig},
    core::{
        exchange::{Exchange, Response},
        interceptor::{Flow, Interceptor, InterceptorError, InterceptorResult, Outcome},
    },
};

/// Keyed limiters drop idle keys after this many checks.
const PRUNE_EVERY: u64 = 4096;

enum Limiter {
    Route(DefaultDirectRateLimiter),
    Ip(DefaultKeyedRateLimiter<IpAddr>),
    Header {
        limiter: DefaultKeyedRateLimiter<String>,
        header_name: HeaderName,
    },
}

enum Verdict {
    Allowed,
    Limited,
    MissingKey(String),
}

pub struct RateLimitInterceptor {
    limiter: Limiter,
    status_code: StatusCode,
    message: String,
    on_missing_key: MissingKeyPolicy,
    checks: AtomicU64,
}

impl RateLimitInterceptor {
    pub fn new(config: &RateLimitConfig) -> InterceptorResult<Self> {
        let invalid = |message: String| InterceptorError::Config(message);

        let period = humantime::parse_duration(&config.period)
            .map_err(|e| invalid(format!("invalid period '{}': {e}", config.period)))?;
        let requests = u32::try_from(config.requests)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| invalid("'requests' must be between 1 and u32::MAX".to_string()))?;
        // `with_period` is the replenish interval of one cell, so spread the
        // period over the burst size.
        let quota = Quota::with_period(period / requests.get())
            .ok_or_else(|| invalid(format!("invalid period duration {period:?}")))?
            .allow_burst(requests);
        let status_code = StatusCode::from_u16(config.status_code)
            .map_err(|_| invalid(format!("invalid status code {}", config.status_code)))?;

        let limiter = match config.by {
            RateLimitBy::Route => Limiter::Route(RateLimiter::direct(quota)),
            RateLimitBy::Ip => Limiter::Ip(RateLimiter::keyed(quota)),
            RateLimitBy::Header => {
                let raw = config
                    .header_name
                    .as_ref()
                    .ok_or_else(|| invalid("header_name is required when by = header".into()))?;
                let header_name = HeaderName::from_bytes(raw.as_bytes())
                    .map_err(|e| invalid(format!("invalid header_name '{raw}': {e}")))?;
                Limiter::Header {
                    limiter: RateLimiter::keyed(quota),
                    header_name,
                }
            }
        };

        tracing::info!(
            "Creating rate limiter: by={:?}, requests={}, period={}, status_code={}, on_missing_key={:?}",
            config.by,
            config.requests,
            config.period,
            config.status_code,
            config.on_missing_key
        );

        Ok(Self {
            limiter,
            status_code,
            message: config.message.clone(),
            on_missing_key: config.on_missing_key,
            checks: AtomicU64::new(0),
        })
    }

    /// Forgets keys whose quota has fully replenished.
    fn prune(&self) {
        match &self.limiter {
            Limiter::Route(_) => {}
            Limiter::Ip(limiter) => {
                limiter.retain_recent();
                limiter.shrink_to_fit();
            }
            Limiter::Header { limiter, .. } => {
                limiter.retain_recent();
                limiter.shrink_to_fit();
            }
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        match &self.limiter {
            Limiter::Route(_) => 0,
            Limiter::Ip(limiter) => limiter.len(),
            Limiter::Header { limiter, .. } => limiter.len(),
        }
    }

    fn check(&self, exchange: &Exchange) -> Verdict {
        if (self.checks.fetch_add(1, Ordering::Relaxed) + 1) % PRUNE_EVERY == 0 {
            self.prune();
        }

        let allowed = match &self.limiter {
            Limiter::Route(limiter) => limiter.check().is_ok(),
            Limiter::Ip(limiter) => match exchange.remote_addr {
                Some(addr) => limiter.check_key(&addr.ip()).is_ok(),
                None => return Verdict::MissingKey("No client IP available".to_string()),
            },
            Limiter::Header {
                limiter,
                header_name,
            } => match exchange.request.header(header_name.as_str()) {
                Some(value) => limiter.check_key(&value.to_string()).is_ok(),
                None => {
                    return Verdict::MissingKey(format!(
                        "Required header '{header_name}' is missing"
                    ));
                }
            },
        };
        if allowed {
            Verdict::Allowed
        } else {
            Verdict::Limited
        }
    }

    fn reject(&self, exchange: &mut Exchange, message: &str) -> Outcome {
        exchange.set_response(
            Response::new(self.status_code).with_body("text/plain", message.to_string()),
        );
        Outcome::Return
    }
}

#[async_trait]
impl Interceptor for RateLimitInterceptor {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn flow(&self) -> Flow {
        Flow::REQUEST
    }

    async fn handle_request(&self, exchange: &mut Exchange) -> InterceptorResult<Outcome> {
        match self.check(exchange) {
            Verdict::Allowed => Ok(Outcome::Continue),
            Verdict::Limited => {
                tracing::debug!("Rate limit exceeded for {}", exchange.request.uri);
                Ok(self.reject(exchange, &self.message))
            }
            Verdict::MissingKey(reason) => match self.on_missing_key {
                MissingKeyPolicy::Allow => Ok(Outcome::Continue),
                MissingKeyPolicy::Deny => Ok(self.reject(exchange, &reason)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::core::exchange::Request;

    fn config(by: RateLimitBy, requests: u64) -> RateLimitConfig {
        RateLimitConfig {
            by,
            header_name: Some("X-Api-Key".to_string()),
            requests,
            period: "1h".to_string(),
            status_code: 429,
            message: "Too Many Requests".to_string(),
            on_missing_key: MissingKeyPolicy::Deny,
        }
    }

    fn from(addr: &str) -> Exchange {
        Exchange::new(Request::get("/")).from_remote(addr.parse::<SocketAddr>().unwrap())
    }

    #[tokio::test]
    async fn test_route_limit_returns_429() {
        let interceptor = RateLimitInterceptor::new(&config(RateLimitBy::Route, 2)).unwrap();

        for _ in 0..2 {
            let mut exchange = from("10.0.0.1:5000");
            assert_eq!(
                interceptor.handle_request(&mut exchange).await.unwrap(),
                Outcome::Continue
            );
        }

        let mut exchange = from("10.0.0.2:5000");
        assert_eq!(
            interceptor.handle_request(&mut exchange).await.unwrap(),
            Outcome::Return
        );
        assert_eq!(exchange.response.unwrap().status, StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_ip_limit_is_per_client() {
        let interceptor = RateLimitInterceptor::new(&config(RateLimitBy::Ip, 1)).unwrap();

        let mut first = from("10.0.0.1:5000");
        let mut again = from("10.0.0.1:5001");
        let mut other = from("10.0.0.2:5000");
        assert_eq!(interceptor.handle_request(&mut first).await.unwrap(), Outcome::Continue);
        assert_eq!(interceptor.handle_request(&mut again).await.unwrap(), Outcome::Return);
        assert_eq!(interceptor.handle_request(&mut other).await.unwrap(), Outcome::Continue);
    }

    #[tokio::test]
    async fn test_missing_header_policy() {
        let interceptor = RateLimitInterceptor::new(&config(RateLimitBy::Header, 5)).unwrap();
        let mut exchange = Exchange::new(Request::get("/"));
        assert_eq!(
            interceptor.handle_request(&mut exchange).await.unwrap(),
            Outcome::Return
        );
        assert!(exchange.response.unwrap().body_text().contains("x-api-key"));

        let mut allow = config(RateLimitBy::Header, 5);
        allow.on_missing_key = MissingKeyPolicy::Allow;
        let interceptor = RateLimitInterceptor::new(&allow).unwrap();
        let mut exchange = Exchange::new(Request::get("/"));
        assert_eq!(
            interceptor.handle_request(&mut exchange).await.unwrap(),
            Outcome::Continue
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config(RateLimitBy::Route, 0);
        assert!(RateLimitInterceptor::new(&bad).is_err());
        bad.requests = 1;
        bad.period = "whenever".to_string();
        assert!(RateLimitInterceptor::new(&bad).is_err());
    }

    #[tokio::test]
    async fn test_idle_keys_are_pruned() {
        let mut short = config(RateLimitBy::Ip, 1);
        short.period = "10ms".to_string();
        let interceptor = RateLimitInterceptor::new(&short).unwrap();

        for i in 1..=3 {
            let mut exchange = from(&format!("10.0.0.{i}:5000"));
            interceptor.handle_request(&mut exchange).await.unwrap();
        }
        assert_eq!(interceptor.tracked_keys(), 3);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        interceptor.prune();
        assert_eq!(interceptor.tracked_keys(), 0);
    }
}
