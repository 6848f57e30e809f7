//! The sign-option pipeline.
//!
//! A successful authorization returns a list of [`SignOption`]s, which the
//! issuing side applies to the certificate request and the certificate
//! template before anything is signed. Every option is exactly one of
//!
//! - a [`RequestValidator`], which checks the certificate request,
//! - a [`TemplateModifier`], which sets fields of the certificate template,
//! - a [`CertificateValidator`], which checks the final template.
//!
//! [`SignOptions::apply`] runs them in that order and stops at the first
//! failure.
use std::{collections::HashSet, hash::Hash, net::IpAddr, time::SystemTime};

use authority_shared::time::Duration;
use snafu::{ResultExt, Snafu, ensure};
use tracing::debug;

mod extension;
mod request;

pub use extension::*;
pub use request::*;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A sign option rejected the request. All variants are policy violations,
/// except [`Error::EncodeProvisionerExtension`].
#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("common name validator: expected common name cannot be empty"))]
    EmptyCommonName,

    #[snafu(display("certificate request has invalid common name {actual:?}, expected {expected:?}"))]
    CommonNameMismatch { expected: String, actual: String },

    #[snafu(display("certificate request does not contain the valid DNS names, got {actual:?}, expected {expected:?}"))]
    DnsNamesMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[snafu(display("certificate request does not contain the valid IP addresses, got {actual:?}, expected {expected:?}"))]
    IpAddressesMismatch {
        expected: Vec<IpAddr>,
        actual: Vec<IpAddr>,
    },

    #[snafu(display("certificate request does not contain the valid email addresses, got {actual:?}, expected {expected:?}"))]
    EmailAddressesMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[snafu(display("certificate request cannot contain {kind}"))]
    UnexpectedNames { kind: &'static str },

    #[snafu(display("certificate request must contain exactly one email address, got {count}"))]
    EmailAddressCount { count: usize },

    #[snafu(display("certificate request has invalid email address {actual:?}, expected {expected:?}"))]
    EmailAddressMismatch { expected: String, actual: String },

    #[snafu(display("email-only identity: expected email address cannot be empty"))]
    EmptyEmailAddress,

    #[snafu(display("certificate template has no validity window"))]
    MissingValidity,

    #[snafu(display("certificate notAfter must be after notBefore"))]
    InvalidValidityWindow,

    #[snafu(display(
        "requested duration of {requested} is less than the authorized minimum certificate duration of {min}"
    ))]
    DurationTooShort { requested: Duration, min: Duration },

    #[snafu(display(
        "requested duration of {requested} is more than the authorized maximum certificate duration of {max}"
    ))]
    DurationTooLong { requested: Duration, max: Duration },

    #[snafu(display("failed to encode provisioner extension"))]
    EncodeProvisionerExtension { source: x509_cert::der::Error },
}

/// Validators which read the certificate request and never mutate anything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestValidator {
    /// The common name must equal the bound value.
    CommonName(String),

    /// The DNS names must equal the bound set, in any order.
    DnsNames(Vec<String>),

    /// The IP addresses must equal the bound set, in any order.
    IpAddresses(Vec<IpAddr>),

    /// The email addresses must equal the bound set, in any order.
    EmailAddresses(Vec<String>),

    /// The request must carry exactly the bound email address and no other
    /// subject alternative names.
    EmailOnlyIdentity(String),
}

impl RequestValidator {
    pub fn validate(&self, request: &CertificateRequest) -> Result<()> {
        match self {
            Self::CommonName(expected) => {
                ensure!(!expected.is_empty(), EmptyCommonNameSnafu);
                ensure!(request.common_name == *expected, CommonNameMismatchSnafu {
                    expected,
                    actual: &request.common_name,
                });
            }
            Self::DnsNames(expected) => {
                ensure!(
                    same_set(expected, &request.dns_names),
                    DnsNamesMismatchSnafu {
                        expected: expected.clone(),
                        actual: request.dns_names.clone(),
                    }
                );
            }
            Self::IpAddresses(expected) => {
                ensure!(
                    same_set(expected, &request.ip_addresses),
                    IpAddressesMismatchSnafu {
                        expected: expected.clone(),
                        actual: request.ip_addresses.clone(),
                    }
                );
            }
            Self::EmailAddresses(expected) => {
                ensure!(
                    same_set(expected, &request.email_addresses),
                    EmailAddressesMismatchSnafu {
                        expected: expected.clone(),
                        actual: request.email_addresses.clone(),
                    }
                );
            }
            Self::EmailOnlyIdentity(expected) => {
                ensure!(request.dns_names.is_empty(), UnexpectedNamesSnafu {
                    kind: "DNS names"
                });
                ensure!(request.ip_addresses.is_empty(), UnexpectedNamesSnafu {
                    kind: "IP addresses"
                });
                ensure!(request.uris.is_empty(), UnexpectedNamesSnafu { kind: "URIs" });

                let [actual] = request.email_addresses.as_slice() else {
                    return EmailAddressCountSnafu {
                        count: request.email_addresses.len(),
                    }
                    .fail();
                };
                ensure!(!expected.is_empty(), EmptyEmailAddressSnafu);
                ensure!(actual == expected, EmailAddressMismatchSnafu { expected, actual });
            }
        }

        Ok(())
    }
}

/// Exact, order-independent set equality.
fn same_set<T: Eq + Hash>(expected: &[T], actual: &[T]) -> bool {
    expected.iter().collect::<HashSet<_>>() == actual.iter().collect::<HashSet<_>>()
}

/// Modifiers which set fields of the certificate template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TemplateModifier {
    /// Starts the validity window now and sets its length to the bound
    /// duration, unless the template already has these values.
    DefaultDuration(Duration),

    /// Adds the provisioner extension to the template.
    ProvisionerExtension(ProvisionerExtension),
}

impl TemplateModifier {
    pub fn modify(&self, template: &mut CertificateTemplate, now: SystemTime) -> Result<()> {
        match self {
            Self::DefaultDuration(duration) => {
                let not_before = *template.not_before.get_or_insert(now);
                template
                    .not_after
                    .get_or_insert_with(|| not_before + **duration);
            }
            Self::ProvisionerExtension(extension) => {
                let extension = extension
                    .to_extension()
                    .context(EncodeProvisionerExtensionSnafu)?;
                template.extensions.push(extension);
            }
        }

        Ok(())
    }
}

/// Validators which check the final certificate template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertificateValidator {
    /// The validity window length must be within `[min, max]`.
    Validity { min: Duration, max: Duration },
}

impl CertificateValidator {
    pub fn validate(&self, template: &CertificateTemplate) -> Result<()> {
        match self {
            Self::Validity { min, max } => {
                let (Some(not_before), Some(not_after)) = (template.not_before, template.not_after)
                else {
                    return MissingValiditySnafu.fail();
                };

                let requested: Duration = not_after
                    .duration_since(not_before)
                    .ok()
                    .filter(|requested| !requested.is_zero())
                    .map(Duration::from)
                    .ok_or(Error::InvalidValidityWindow)?;

                ensure!(requested >= *min, DurationTooShortSnafu {
                    requested,
                    min: *min
                });
                ensure!(requested <= *max, DurationTooLongSnafu {
                    requested,
                    max: *max
                });
            }
        }

        Ok(())
    }
}

/// A single step of the sign-option pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignOption {
    Request(RequestValidator),
    Modifier(TemplateModifier),
    Certificate(CertificateValidator),
}

impl SignOption {
    pub fn common_name(expected: impl Into<String>) -> Self {
        Self::Request(RequestValidator::CommonName(expected.into()))
    }

    pub fn dns_names(expected: Vec<String>) -> Self {
        Self::Request(RequestValidator::DnsNames(expected))
    }

    pub fn ip_addresses(expected: Vec<IpAddr>) -> Self {
        Self::Request(RequestValidator::IpAddresses(expected))
    }

    pub fn email_addresses(expected: Vec<String>) -> Self {
        Self::Request(RequestValidator::EmailAddresses(expected))
    }

    pub fn email_only_identity(expected: impl Into<String>) -> Self {
        Self::Request(RequestValidator::EmailOnlyIdentity(expected.into()))
    }

    pub fn default_duration(duration: Duration) -> Self {
        Self::Modifier(TemplateModifier::DefaultDuration(duration))
    }

    pub fn provisioner_extension(extension: ProvisionerExtension) -> Self {
        Self::Modifier(TemplateModifier::ProvisionerExtension(extension))
    }

    pub fn validity(min: Duration, max: Duration) -> Self {
        Self::Certificate(CertificateValidator::Validity { min, max })
    }
}

/// The ordered sign options produced by one authorization.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignOptions(Vec<SignOption>);

impl SignOptions {
    pub fn new(options: Vec<SignOption>) -> Self {
        Self(options)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SignOption> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Applies all options using the current time, see
    /// [`Self::apply_at`].
    pub fn apply(
        &self,
        request: &CertificateRequest,
        template: &mut CertificateTemplate,
    ) -> Result<()> {
        self.apply_at(request, template, SystemTime::now())
    }

    /// Runs all request validators, then all template modifiers, then all
    /// certificate validators. No option is skipped, the first failure is
    /// returned.
    pub fn apply_at(
        &self,
        request: &CertificateRequest,
        template: &mut CertificateTemplate,
        now: SystemTime,
    ) -> Result<()> {
        for option in &self.0 {
            if let SignOption::Request(validator) = option {
                validator.validate(request)?;
            }
        }
        for option in &self.0 {
            if let SignOption::Modifier(modifier) = option {
                modifier.modify(template, now)?;
            }
        }
        for option in &self.0 {
            if let SignOption::Certificate(validator) = option {
                validator.validate(template)?;
            }
        }

        debug!(
            sign_options.count = self.0.len(),
            "certificate request passed all sign options"
        );
        Ok(())
    }
}

impl From<Vec<SignOption>> for SignOptions {
    fn from(options: Vec<SignOption>) -> Self {
        Self(options)
    }
}

impl IntoIterator for SignOptions {
    type IntoIter = std::vec::IntoIter<SignOption>;
    type Item = SignOption;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a SignOptions {
    type IntoIter = std::slice::Iter<'a, SignOption>;
    type Item = &'a SignOption;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
