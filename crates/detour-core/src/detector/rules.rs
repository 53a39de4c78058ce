//! Per-country interference signatures

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use super::FailureKind;

/// Signature table for one country
#[derive(Debug)]
pub struct CountryRules {
    /// Upper-case country code, empty for the generic table
    pub country: &'static str,
    /// Failure kinds treated as tampering
    pub tampering: &'static [FailureKind],
    /// Addresses a poisoned resolver hands out
    pub dns_redirects: &'static [IpAddr],
    /// Prefixes of injected responses
    pub fake_responses: &'static [&'static [u8]],
}

const GENERIC_TAMPERING: &[FailureKind] = &[
    FailureKind::Timeout,
    FailureKind::Reset,
    FailureKind::BrokenPipe,
];

/// Rules used when no country is configured or the country is unknown
pub static GENERIC: CountryRules = CountryRules {
    country: "",
    tampering: GENERIC_TAMPERING,
    dns_redirects: &[],
    fake_responses: &[],
};

static IRAN: CountryRules = CountryRules {
    country: "IR",
    tampering: GENERIC_TAMPERING,
    dns_redirects: &[IpAddr::V4(Ipv4Addr::new(10, 10, 34, 34))],
    fake_responses: &[b"HTTP/1.1 403 Forbidden\r\nConnection:close\r\n\r\n<html><head><meta http-equiv=\"Content-Type\" content=\"text/html; charset=windows-1256\"><title>M1-6"],
};

static BY_COUNTRY: Lazy<HashMap<&'static str, &'static CountryRules>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(IRAN.country, &IRAN);
    map
});

/// Look up the table for a country code (case-insensitive)
pub(super) fn for_country(country: &str) -> &'static CountryRules {
    BY_COUNTRY
        .get(country.to_ascii_uppercase().as_str())
        .copied()
        .unwrap_or(&GENERIC)
}
