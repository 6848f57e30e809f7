use const_oid::ObjectIdentifier;
use der::{Decode, Encode, Sequence, Tag, asn1::OctetString};
use x509_cert::ext::Extension;

use crate::provisioner::ProvisionerType;

/// OID of the custom extension which records the provisioner that
/// authorized the issuance of a certificate.
pub const PROVISIONER_EXTENSION_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.37476.9000.64.1");

/// The provisioner which authorized a certificate, stamped into the issued
/// certificate as
///
/// ```text
/// Provisioner ::= SEQUENCE {
///     type         INTEGER,
///     name         OCTET STRING,
///     credentialID OCTET STRING
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionerExtension {
    pub provisioner_type: ProvisionerType,
    pub name: String,

    /// The credential which was presented, e.g. the authorized party of a
    /// GCP token or the key id of a JWK provisioner.
    pub credential_id: String,
}

impl ProvisionerExtension {
    pub fn new(
        provisioner_type: ProvisionerType,
        name: impl Into<String>,
        credential_id: impl Into<String>,
    ) -> Self {
        Self {
            provisioner_type,
            name: name.into(),
            credential_id: credential_id.into(),
        }
    }

    pub fn to_der(&self) -> der::Result<Vec<u8>> {
        ProvisionerRecord {
            provisioner_type: self.provisioner_type.into(),
            name: OctetString::new(self.name.as_bytes())?,
            credential_id: OctetString::new(self.credential_id.as_bytes())?,
        }
        .to_der()
    }

    pub fn from_der(bytes: &[u8]) -> der::Result<Self> {
        let record = ProvisionerRecord::from_der(bytes)?;

        let provisioner_type = ProvisionerType::try_from(record.provisioner_type)
            .map_err(|_| Tag::Integer.value_error())?;
        let utf8 = |value: OctetString| {
            String::from_utf8(value.into_bytes()).map_err(|_| Tag::OctetString.value_error())
        };

        Ok(Self {
            provisioner_type,
            name: utf8(record.name)?,
            credential_id: utf8(record.credential_id)?,
        })
    }

    /// Returns the non-critical certificate extension.
    pub fn to_extension(&self) -> der::Result<Extension> {
        Ok(Extension {
            extn_id: PROVISIONER_EXTENSION_OID,
            critical: false,
            extn_value: OctetString::new(self.to_der()?)?,
        })
    }
}

/// The DER form of [`ProvisionerExtension`].
#[derive(Sequence)]
struct ProvisionerRecord {
    provisioner_type: u32,
    name: OctetString,
    credential_id: OctetString,
}
