use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::SystemTime,
};

use const_oid::{ObjectIdentifier, db::rfc4519::CN};
use snafu::{ResultExt, Snafu};
use x509_cert::{
    der::{Decode, DecodePem, Encode, Tag, Tagged},
    ext::{
        Extension,
        pkix::{ID_CE_SUBJECT_ALT_NAME, SubjectAltName, name::GeneralName},
    },
    name::Name,
    request::{CertReq, ExtensionReq},
};

/// PKCS#9 extension request attribute, which carries the requested
/// certificate extensions of a PKCS#10 request.
const ID_EXTENSION_REQ: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");

#[derive(Debug, Snafu)]
pub enum ParseRequestError {
    #[snafu(display("failed to decode certificate request"))]
    DecodeRequest { source: x509_cert::der::Error },

    #[snafu(display("failed to decode extension request attribute"))]
    DecodeExtensionRequest { source: x509_cert::der::Error },

    #[snafu(display("failed to decode subject alternative name extension"))]
    DecodeSubjectAltName { source: x509_cert::der::Error },

    #[snafu(display("subject alternative name contains an IP address of {len} bytes"))]
    InvalidIpAddress { len: usize },
}

/// The identity fields of a certificate signing request which the sign
/// options validate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateRequest {
    pub common_name: String,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub email_addresses: Vec<String>,
    pub uris: Vec<String>,
}

impl CertificateRequest {
    /// Parses a DER encoded PKCS#10 certificate request. The signature of the
    /// request is not checked here, proof of possession is verified by the
    /// issuing side.
    pub fn from_der(der: &[u8]) -> Result<Self, ParseRequestError> {
        let request = CertReq::from_der(der).context(DecodeRequestSnafu)?;
        Self::from_cert_req(&request)
    }

    /// Parses a PEM encoded PKCS#10 certificate request.
    pub fn from_pem(pem: &str) -> Result<Self, ParseRequestError> {
        let request = CertReq::from_pem(pem.as_bytes()).context(DecodeRequestSnafu)?;
        Self::from_cert_req(&request)
    }

    fn from_cert_req(request: &CertReq) -> Result<Self, ParseRequestError> {
        let mut parsed = Self {
            common_name: common_name(&request.info.subject).unwrap_or_default(),
            ..Self::default()
        };

        let extensions = request
            .info
            .attributes
            .iter()
            .filter(|attribute| attribute.oid == ID_EXTENSION_REQ)
            .flat_map(|attribute| attribute.values.iter());

        for value in extensions {
            let der = value.to_der().context(DecodeExtensionRequestSnafu)?;
            let ExtensionReq(extensions) =
                ExtensionReq::from_der(&der).context(DecodeExtensionRequestSnafu)?;

            for extension in extensions
                .iter()
                .filter(|extension| extension.extn_id == ID_CE_SUBJECT_ALT_NAME)
            {
                let sans = SubjectAltName::from_der(extension.extn_value.as_bytes())
                    .context(DecodeSubjectAltNameSnafu)?;
                parsed.add_names(sans.0)?;
            }
        }

        Ok(parsed)
    }

    fn add_names(&mut self, names: Vec<GeneralName>) -> Result<(), ParseRequestError> {
        for name in names {
            match name {
                GeneralName::DnsName(dns_name) => self.dns_names.push(dns_name.to_string()),
                GeneralName::Rfc822Name(email) => self.email_addresses.push(email.to_string()),
                GeneralName::UniformResourceIdentifier(uri) => self.uris.push(uri.to_string()),
                GeneralName::IpAddress(ip) => self.ip_addresses.push(ip_from_bytes(ip.as_bytes())?),
                _ => (),
            }
        }

        Ok(())
    }
}

fn common_name(subject: &Name) -> Option<String> {
    subject
        .0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == CN)
        .and_then(|atv| match atv.value.tag() {
            Tag::Utf8String | Tag::PrintableString | Tag::Ia5String => {
                std::str::from_utf8(atv.value.value()).ok().map(str::to_owned)
            }
            _ => None,
        })
}

fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr, ParseRequestError> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    InvalidIpAddressSnafu { len: bytes.len() }.fail()
}

/// The mutable parts of the certificate which will be issued for a request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateTemplate {
    pub not_before: Option<SystemTime>,
    pub not_after: Option<SystemTime>,
    pub extensions: Vec<Extension>,
}
