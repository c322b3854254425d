use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use epcis_common::batch::FailureThreshold;

use crate::selector::DispatchSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3303")]
    pub port: u16,

    #[envconfig(from = "CMS_BASE_URL")]
    pub cms_base_url: NonEmptyString,

    #[envconfig(from = "CMS_API_KEY", default = "")]
    pub cms_api_key: String,

    #[envconfig(from = "DISPATCH_BATCH_SIZE", default = "10")]
    pub batch_size: usize,

    #[envconfig(from = "DISPATCH_MAX_RETRIES", default = "3")]
    pub max_attempts: u32,

    #[envconfig(from = "FAILURE_THRESHOLD", default = "0.5")]
    pub failure_threshold: FailureThreshold,

    #[envconfig(default = "300000")]
    pub cycle_interval: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(default = "shipping_scanning_operation")]
    pub shipping_collection: NonEmptyString,

    #[envconfig(default = "EPCIS_outbound")]
    pub dispatch_collection: NonEmptyString,

    pub default_receiver_gln: Option<NonEmptyString>,

    #[envconfig(nested = true)]
    pub partner: PartnerConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            batch_size: self.batch_size.max(1),
            max_attempts: self.max_attempts.max(1),
            failure_threshold: self.failure_threshold,
            confirmation_window_days: self.partner.status_lookback_days.max(1),
        }
    }

    /// How long the dispatch loop may go without reporting before it is considered
    /// stuck: two cycle intervals plus one request timeout per batch item.
    /// Saturates at `Duration::MAX` rather than overflowing.
    pub fn liveness_deadline(&self) -> time::Duration {
        let busy = u32::try_from(self.dispatch_settings().batch_size)
            .ok()
            .and_then(|items| self.request_timeout.0.checked_mul(items));

        self.cycle_interval
            .0
            .checked_mul(2)
            .zip(busy)
            .and_then(|(idle, busy)| idle.checked_add(busy))
            .unwrap_or(time::Duration::MAX)
    }
}

#[derive(Envconfig, Clone)]
pub struct PartnerConfig {
    #[envconfig(
        from = "PARTNER_ENDPOINT",
        default = "https://demo.partner.trust.med/v1/client/storage"
    )]
    pub endpoint: NonEmptyString,

    #[envconfig(from = "PARTNER_CERT_FILE", default = "certs/partner/client-cert.crt")]
    pub cert_file: String,

    #[envconfig(from = "PARTNER_KEY_FILE", default = "certs/partner/client-key.key")]
    pub key_file: String,

    #[envconfig(from = "PARTNER_CA_FILE", default = "certs/partner/partner-ca.crt")]
    pub ca_file: String,

    #[envconfig(
        from = "PARTNER_DASHBOARD_URL",
        default = "https://demo.dashboard.trust.med/api/v1.0"
    )]
    pub dashboard_url: NonEmptyString,

    #[envconfig(from = "PARTNER_USERNAME", default = "")]
    pub username: String,

    #[envconfig(from = "PARTNER_PASSWORD", default = "")]
    pub password: String,

    #[envconfig(from = "PARTNER_CLIENT_ID", default = "37018")]
    pub client_id: NonEmptyString,

    #[envconfig(from = "PARTNER_COMPANY_ID", default = "37018")]
    pub company_id: NonEmptyString,

    #[envconfig(from = "PARTNER_STATUS_LOOKBACK_DAYS", default = "90")]
    pub status_lookback_days: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.trim().to_owned()))
        }
    }
}
