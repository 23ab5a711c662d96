//! CIDR allow-lists for client-secret logins and access-token use.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::error::AuthError;

pub const ALLOW_ALL_V4: &str = "0.0.0.0/0";
pub const ALLOW_ALL_V6: &str = "::/0";

/// One allow-list entry as persisted: `{ "ipAddress": "10.0.0.0/8" }`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrustedIp {
    pub ip_address: String,
}

impl TrustedIp {
    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
        }
    }

    fn is_allow_all(&self) -> bool {
        matches!(self.ip_address.as_str(), ALLOW_ALL_V4 | ALLOW_ALL_V6)
    }
}

/// A validated, non-empty list of trusted networks.
///
/// The original entry strings are kept verbatim so a config round-trips exactly through
/// updates that don't touch it; the parsed networks are used for matching.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TrustedIp>", into = "Vec<TrustedIp>")]
pub struct TrustedIpList {
    entries: Vec<TrustedIp>,
    networks: Vec<IpNetwork>,
}

impl TrustedIpList {
    /// Validate and build a list.
    ///
    /// # Errors
    /// Returns `Validation` if the list is empty or an entry is not an IP address or CIDR.
    pub fn new(entries: Vec<TrustedIp>) -> Result<Self, AuthError> {
        if entries.is_empty() {
            return Err(AuthError::validation(
                "trusted IP list must contain at least one entry",
            ));
        }
        let mut normalized = Vec::with_capacity(entries.len());
        let mut networks = Vec::with_capacity(entries.len());
        for entry in entries {
            let trimmed = entry.ip_address.trim().to_string();
            let network = IpNetwork::from_str(&trimmed).map_err(|_| {
                AuthError::validation(format!("invalid trusted IP entry: {trimmed}"))
            })?;
            normalized.push(TrustedIp::new(trimmed));
            networks.push(network);
        }
        Ok(Self {
            entries: normalized,
            networks,
        })
    }

    /// Build a list from plain address strings.
    ///
    /// # Errors
    /// Same as [`TrustedIpList::new`].
    pub fn parse<I, S>(addresses: I) -> Result<Self, AuthError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(addresses.into_iter().map(TrustedIp::new).collect())
    }

    /// `[0.0.0.0/0, ::/0]`
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            entries: vec![TrustedIp::new(ALLOW_ALL_V4), TrustedIp::new(ALLOW_ALL_V6)],
            networks: [
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            ]
            .into_iter()
            .filter_map(|addr| IpNetwork::new(addr, 0).ok())
            .collect(),
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[TrustedIp] {
        &self.entries
    }

    /// Whether every entry is one of the "allow everything" networks.
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.entries.iter().all(TrustedIp::is_allow_all)
    }

    /// Whether any entry narrows access below "allow everything".
    #[must_use]
    pub fn is_restricted(&self) -> bool {
        !self.is_unrestricted()
    }

    /// IPv4-mapped IPv6 callers (`::ffff:a.b.c.d`) are matched as IPv4.
    #[must_use]
    pub fn is_allowed(&self, address: IpAddr) -> bool {
        let address = canonical(address);
        self.networks.iter().any(|network| network.contains(address))
    }
}

impl Default for TrustedIpList {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl TryFrom<Vec<TrustedIp>> for TrustedIpList {
    type Error = AuthError;

    fn try_from(entries: Vec<TrustedIp>) -> Result<Self, Self::Error> {
        Self::new(entries)
    }
}

impl From<TrustedIpList> for Vec<TrustedIp> {
    fn from(list: TrustedIpList) -> Self {
        list.entries
    }
}

impl fmt::Display for TrustedIpList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .entries
            .iter()
            .map(|entry| entry.ip_address.as_str())
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

fn canonical(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 @ IpAddr::V4(_) => v4,
    }
}
