//! Credential assembly: turns a resolved bucket and secret into the bytes
//! written into the bucket directory.

use std::collections::BTreeMap;

use crate::error::CredentialError;
use crate::types::{BucketRecord, Protocol, SecretPayload};

/// Serialize the bucket's single protocol variant.
///
/// Only the variant's own fields are written (no wrapping key), so a
/// consumer decodes `protocolConn.json` straight into the protocol struct.
pub fn extract_protocol(bucket: &BucketRecord) -> Result<Vec<u8>, CredentialError> {
    let encoded = match bucket.protocol.variant()? {
        Protocol::S3(s3) => serde_json::to_vec(&s3),
        Protocol::AzureBlob(azure) => serde_json::to_vec(&azure),
        Protocol::Gcs(gcs) => serde_json::to_vec(&gcs),
    };
    encoded.map_err(|source| CredentialError::Serialize {
        what: "protocol connection",
        source,
    })
}

/// Flatten the secret's binary values into strings and serialize the map.
///
/// Values that are not valid UTF-8 are converted lossily.
pub fn extract_secret(secret: &SecretPayload) -> Result<Vec<u8>, CredentialError> {
    let flat: BTreeMap<&str, String> = secret
        .data
        .iter()
        .map(|(k, v)| (k.as_str(), String::from_utf8_lossy(v).into_owned()))
        .collect();

    serde_json::to_vec(&flat).map_err(|source| CredentialError::Serialize {
        what: "credentials",
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AzureBlob, Gcs, ProtocolSpec, S3};

    fn bucket(protocol: ProtocolSpec) -> BucketRecord {
        BucketRecord {
            name: "bucket-1".into(),
            protocol,
            bucket_available: true,
        }
    }

    #[test]
    fn test_extract_s3() {
        let s3 = S3 {
            endpoint: "https://s3.example.com".into(),
            bucket_name: "photos".into(),
            region: "eu-west-1".into(),
            signature_version: "S3V4".into(),
        };
        let bytes = extract_protocol(&bucket(Protocol::S3(s3.clone()).into())).unwrap();

        let decoded: S3 = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, s3);
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["bucketName"], "photos");
        assert_eq!(raw["signatureVersion"], "S3V4");
    }

    #[test]
    fn test_extract_azure_blob() {
        let azure = AzureBlob {
            container_name: "logs".into(),
            storage_account: "acct".into(),
        };
        let bytes = extract_protocol(&bucket(Protocol::AzureBlob(azure.clone()).into())).unwrap();
        assert_eq!(serde_json::from_slice::<AzureBlob>(&bytes).unwrap(), azure);
    }

    #[test]
    fn test_extract_gcs() {
        let gcs = Gcs {
            bucket_name: "archive".into(),
            private_key_name: "key".into(),
            project_id: "proj".into(),
            service_account: "sa@proj".into(),
        };
        let bytes = extract_protocol(&bucket(Protocol::Gcs(gcs.clone()).into())).unwrap();
        assert_eq!(serde_json::from_slice::<Gcs>(&bytes).unwrap(), gcs);
    }

    #[test]
    fn test_extract_no_protocol() {
        let err = extract_protocol(&bucket(ProtocolSpec::default())).unwrap_err();
        assert!(matches!(
            err,
            CredentialError::UnrecognizedProtocol(ref p) if p.populated == 0
        ));
    }

    #[test]
    fn test_extract_multiple_protocols() {
        let spec = ProtocolSpec {
            s3: Some(S3::default()),
            azure_blob: None,
            gcs: Some(Gcs::default()),
        };
        let err = extract_protocol(&bucket(spec)).unwrap_err();
        assert!(matches!(
            err,
            CredentialError::UnrecognizedProtocol(ref p) if p.populated == 2
        ));
    }

    #[test]
    fn test_extract_secret_flattens_values() {
        let secret: SecretPayload = [
            ("accessKeyID", b"AKIA".to_vec()),
            ("accessSecretKey", b"s3cr3t".to_vec()),
            ("binary", vec![0xff, b'a']),
        ]
        .into_iter()
        .collect();

        let bytes = extract_secret(&secret).unwrap();
        let decoded: BTreeMap<String, String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded["accessKeyID"], "AKIA");
        assert_eq!(decoded["accessSecretKey"], "s3cr3t");
        assert_eq!(decoded["binary"], "\u{fffd}a");
    }

    #[test]
    fn test_extract_empty_secret() {
        let bytes = extract_secret(&SecretPayload::default()).unwrap();
        assert_eq!(bytes, b"{}");
    }
}
