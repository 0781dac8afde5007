//! Client settings
//!
//! The configuration surface the engine consumes: bandwidth caps, the IP
//! violation toggle, and the rent payment terms parsed from their
//! human-readable forms (currency strings for funds, block-duration strings
//! for periods).

use dxstor_core::unit;
use dxstor_core::{DxError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rent payment terms for contract formation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RentPayment {
    /// Total fund in wei.
    pub fund: u128,
    /// Number of hosts to form contracts with.
    pub storage_hosts: u64,
    /// Contract duration in blocks.
    pub period: u64,
    /// Blocks before expiry at which renewal starts.
    pub renew_window: u64,
    pub expected_storage: u64,
    pub expected_upload: u64,
    pub expected_download: u64,
    /// Target redundancy as a ratio of `num_sectors / min_sectors`,
    /// stored ×100.
    pub expected_redundancy: u64,
}

impl Default for RentPayment {
    fn default() -> Self {
        Self {
            fund: 0,
            storage_hosts: 50,
            period: 3 * unit::BLOCKS_PER_MONTH,
            renew_window: unit::BLOCKS_PER_WEEK,
            expected_storage: 1 << 40,           // 1 TiB
            expected_upload: (1 << 40) / 4,      // 256 GiB per period
            expected_download: (1 << 40) / 8,    // 128 GiB per period
            expected_redundancy: 300,            // 3.0x
        }
    }
}

impl RentPayment {
    /// Parse the user-facing string fields of a rent payment.
    pub fn parse(
        fund: &str,
        storage_hosts: &str,
        period: &str,
        renew_window: &str,
    ) -> Result<Self> {
        let parsed = Self {
            fund: unit::parse_currency(fund)?,
            storage_hosts: unit::parse_storage_hosts(storage_hosts)?,
            period: unit::parse_period(period)?,
            renew_window: unit::parse_period(renew_window)?,
            ..Self::default()
        };
        if parsed.renew_window >= parsed.period {
            return Err(DxError::Validation(format!(
                "renew window {} must be shorter than the period {}",
                parsed.renew_window, parsed.period
            )));
        }
        Ok(parsed)
    }
}

/// Settings the engine consumes. Everything else (host scoring weights,
/// chain parameters) belongs to the outer layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Upload bandwidth cap in bytes/sec; 0 disables the limit.
    pub max_upload_speed: i64,
    /// Download bandwidth cap in bytes/sec; 0 disables the limit.
    pub max_download_speed: i64,
    /// When true, two hosts in the same /24 cannot both serve one segment.
    pub enable_ip_violation: bool,
    /// Pause after each sector download response. Default 0.
    pub download_response_delay: Duration,
    pub rent_payment: RentPayment,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            max_upload_speed: 0,
            max_download_speed: 0,
            enable_ip_violation: false,
            download_response_delay: Duration::ZERO,
            rent_payment: RentPayment::default(),
        }
    }
}

impl ClientSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_upload_speed < 0 || self.max_download_speed < 0 {
            return Err(DxError::Validation(format!(
                "upload speed {} and download speed {} cannot be negative",
                self.max_upload_speed, self.max_download_speed
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_payment_parse() {
        let payment = RentPayment::parse("500 Gwei", "30", "3 M", "1 W").unwrap();
        assert_eq!(payment.fund, 500_000_000_000);
        assert_eq!(payment.storage_hosts, 30);
        assert_eq!(payment.period, 3 * unit::BLOCKS_PER_MONTH);
        assert_eq!(payment.renew_window, unit::BLOCKS_PER_WEEK);
    }

    #[test]
    fn test_rent_payment_rejects_long_renew_window() {
        assert!(RentPayment::parse("1 ether", "30", "1 W", "2 W").is_err());
    }

    #[test]
    fn test_settings_validate() {
        let mut settings = ClientSettings::default();
        settings.validate().unwrap();
        settings.max_upload_speed = -1;
        assert!(settings.validate().is_err());
    }
}
