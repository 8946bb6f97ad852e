//! AWS Signature V4 request signing for the index service.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// Headers to attach to a signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub authorization: String,
    pub content_sha256: String,
    pub amz_date: String,
}

#[derive(Debug, Clone)]
pub struct SigningKey {
    access_key: String,
    secret_key: String,
    region: String,
    service: String,
}

impl SigningKey {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            region: region.into(),
            service: service.into(),
        }
    }

    /// Sign a request.
    ///
    /// `path` must already be percent-encoded and `query` canonical (sorted,
    /// encoded `k=v` pairs joined by `&`).
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query: &str,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> SignedHeaders {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let content_sha256 = hex::encode(Sha256::digest(body));

        let canonical_request = format!(
            "{method}\n{path}\n{query}\nhost:{host}\nx-amz-content-sha256:{content_sha256}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{content_sha256}"
        );

        let scope = format!(
            "{date_stamp}/{}/{}/aws4_request",
            self.region, self.service
        );
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = hex::encode(hmac(&self.derive_key(&date_stamp), string_to_sign.as_bytes()));

        SignedHeaders {
            authorization: format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
                self.access_key
            ),
            content_sha256,
            amz_date,
        }
    }

    fn derive_key(&self, date_stamp: &str) -> Vec<u8> {
        let k_date = hmac(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = hmac(&k_date, self.region.as_bytes());
        let k_service = hmac(&k_region, self.service.as_bytes());
        hmac(&k_service, b"aws4_request")
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap()
    }

    #[test]
    fn test_signing_key_derivation_matches_reference_vector() {
        // Reference key derivation from the AWS SigV4 documentation
        let key = SigningKey::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "us-east-1",
            "iam",
        );
        assert_eq!(
            hex::encode(key.derive_key("20150830")),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn test_authorization_header_layout() {
        let key = SigningKey::new("AKID", "secret", "us-west-2", "s3");
        let headers = key.sign(
            "GET",
            "127.0.0.1:28049",
            "/indexes/idx",
            "keys=1000",
            b"",
            fixed_time(),
        );

        assert_eq!(headers.amz_date, "20150830T123600Z");
        assert_eq!(
            headers.content_sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(headers.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKID/20150830/us-west-2/s3/aws4_request, SignedHeaders=host;x-amz-content-sha256;x-amz-date, Signature="
        ));
        let signature = headers.authorization.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);
    }

    #[test]
    fn test_signature_covers_body_and_path() {
        let key = SigningKey::new("AKID", "secret", "us-west-2", "s3");
        let a = key.sign("PUT", "h", "/indexes/idx/k", "", b"one", fixed_time());
        let b = key.sign("PUT", "h", "/indexes/idx/k", "", b"two", fixed_time());
        let c = key.sign("PUT", "h", "/indexes/idx/other", "", b"one", fixed_time());

        assert_ne!(a.authorization, b.authorization);
        assert_ne!(a.authorization, c.authorization);
        assert_eq!(
            a,
            key.sign("PUT", "h", "/indexes/idx/k", "", b"one", fixed_time())
        );
    }
}
