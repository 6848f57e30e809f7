//! Certificate lifetime and renewal policy.
//!
//! [`Claims`] are the optional overrides which can be attached to the global
//! authority configuration and to each provisioner. A [`Claimer`] flattens
//! them once, when the provisioner is initialized, into the effective policy
//! of that provisioner.
use authority_shared::time::Duration;
use serde::{Deserialize, Serialize};
use snafu::{Snafu, ensure};

/// The minimum certificate lifetime used when neither the provisioner nor
/// the global configuration specify one.
pub const DEFAULT_MIN_TLS_CERT_DURATION: Duration = Duration::from_minutes_unchecked(5);

/// The maximum certificate lifetime used when neither the provisioner nor
/// the global configuration specify one.
pub const DEFAULT_MAX_TLS_CERT_DURATION: Duration = Duration::from_hours_unchecked(24);

/// The certificate lifetime used when the request doesn't ask for one and
/// neither the provisioner nor the global configuration specify a default.
pub const DEFAULT_TLS_CERT_DURATION: Duration = Duration::from_hours_unchecked(24);

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("claims: {field} cannot be zero"))]
    ZeroDuration { field: &'static str },

    #[snafu(display(
        "claims: maxTLSCertDuration ({max}) cannot be less than minTLSCertDuration ({min})"
    ))]
    MaxLessThanMin { min: Duration, max: Duration },

    #[snafu(display(
        "claims: defaultTLSCertDuration ({default}) cannot be less than minTLSCertDuration ({min})"
    ))]
    DefaultLessThanMin { min: Duration, default: Duration },

    #[snafu(display(
        "claims: defaultTLSCertDuration ({default}) cannot be greater than maxTLSCertDuration ({max})"
    ))]
    DefaultGreaterThanMax { default: Duration, max: Duration },
}

/// Optional policy overrides. Absent fields are inherited, see
/// [`Claimer::new`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    #[serde(rename = "minTLSCertDuration", skip_serializing_if = "Option::is_none")]
    pub min_tls_cert_duration: Option<Duration>,

    #[serde(rename = "maxTLSCertDuration", skip_serializing_if = "Option::is_none")]
    pub max_tls_cert_duration: Option<Duration>,

    #[serde(rename = "defaultTLSCertDuration", skip_serializing_if = "Option::is_none")]
    pub default_tls_cert_duration: Option<Duration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_renewal: Option<bool>,
}

/// The resolved and validated policy of a single provisioner.
///
/// The invariant `min <= default <= max` holds for every constructed
/// [`Claimer`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Claimer {
    min_tls_cert_duration: Duration,
    max_tls_cert_duration: Duration,
    default_tls_cert_duration: Duration,
    disable_renewal: bool,
}

impl Claimer {
    /// Resolves each field from `local`, then `global`, then the hard-coded
    /// system default, and validates the result.
    pub fn new(local: Option<&Claims>, global: Option<&Claims>) -> Result<Self> {
        fn resolve<T: Copy>(
            local: Option<&Claims>,
            global: Option<&Claims>,
            field: fn(&Claims) -> Option<T>,
            default: T,
        ) -> T {
            local
                .and_then(field)
                .or_else(|| global.and_then(field))
                .unwrap_or(default)
        }

        let claimer = Self {
            min_tls_cert_duration: resolve(
                local,
                global,
                |c| c.min_tls_cert_duration,
                DEFAULT_MIN_TLS_CERT_DURATION,
            ),
            max_tls_cert_duration: resolve(
                local,
                global,
                |c| c.max_tls_cert_duration,
                DEFAULT_MAX_TLS_CERT_DURATION,
            ),
            default_tls_cert_duration: resolve(
                local,
                global,
                |c| c.default_tls_cert_duration,
                DEFAULT_TLS_CERT_DURATION,
            ),
            disable_renewal: resolve(local, global, |c| c.disable_renewal, false),
        };

        claimer.validate()?;
        Ok(claimer)
    }

    fn validate(&self) -> Result<()> {
        let min = self.min_tls_cert_duration;
        let max = self.max_tls_cert_duration;
        let default = self.default_tls_cert_duration;

        ensure!(!min.is_zero(), ZeroDurationSnafu {
            field: "minTLSCertDuration"
        });
        ensure!(!max.is_zero(), ZeroDurationSnafu {
            field: "maxTLSCertDuration"
        });
        ensure!(!default.is_zero(), ZeroDurationSnafu {
            field: "defaultTLSCertDuration"
        });
        ensure!(max >= min, MaxLessThanMinSnafu { min, max });
        ensure!(default >= min, DefaultLessThanMinSnafu { min, default });
        ensure!(default <= max, DefaultGreaterThanMaxSnafu { default, max });

        Ok(())
    }

    pub fn min_tls_cert_duration(&self) -> Duration {
        self.min_tls_cert_duration
    }

    pub fn max_tls_cert_duration(&self) -> Duration {
        self.max_tls_cert_duration
    }

    pub fn default_tls_cert_duration(&self) -> Duration {
        self.default_tls_cert_duration
    }

    pub fn is_disable_renewal(&self) -> bool {
        self.disable_renewal
    }
}
