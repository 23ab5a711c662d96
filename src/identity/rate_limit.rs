//! Rate limiting hooks for machine logins.

use std::net::IpAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitAction {
    UniversalAuthLogin,
    GcpAuthLogin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    fn check_ip(&self, ip: IpAddr, action: RateLimitAction) -> RateLimitDecision;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check_ip(&self, _ip: IpAddr, _action: RateLimitAction) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}
