// Originally from https://github.com/rust-lang/crates.io/blob/master/src/s3/lib.rs
//
// Modernized from hyper 0.1 + futures 0.1 + `rust-crypto` to `reqwest` +
// `hmac`/`sha1`, keeping the same get/put shape and SigV2 canonical-string
// signer.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use log::{debug, info, trace};
use sha1::Sha1;

use crate::errors::{ProxyError, Result};
use crate::simples3::AwsCredentials;

#[derive(Debug, Copy, Clone)]
#[allow(dead_code)]
/// Whether or not to use SSL.
pub enum Ssl {
    Yes,
    No,
}

fn base_url(endpoint: &str, ssl: Ssl) -> String {
    format!(
        "{}://{}/",
        match ssl {
            Ssl::Yes => "https",
            Ssl::No => "http",
        },
        endpoint
    )
}

fn signature(string_to_sign: &str, signing_key: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(signing_key.as_bytes())
        .expect("HMAC accepts a key of any length");
    mac.update(string_to_sign.as_bytes());
    BASE64_STANDARD.encode(mac.finalize().into_bytes())
}

/// An S3 bucket.
#[derive(Clone)]
pub struct Bucket {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Bucket(name={}, base_url={})", self.inner.name, self.inner.base_url)
    }
}

impl Bucket {
    pub fn new(name: &str, endpoint: &str, ssl: Ssl) -> Bucket {
        Bucket {
            inner: Arc::new(Inner {
                name: name.to_owned(),
                base_url: base_url(endpoint, ssl),
                client: reqwest::Client::new(),
            }),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.inner.base_url, key);
        debug!("GET {}", url);
        let res = self
            .inner
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProxyError::Rpc(format!("failed GET {}: {}", url, e)))?;
        if !res.status().is_success() {
            return Err(ProxyError::Rpc(format!("bad HTTP status {} for GET {}", res.status(), url)));
        }
        let content_length = res.content_length();
        let bytes = res
            .bytes()
            .await
            .map_err(|e| ProxyError::Rpc(format!("failed reading body of GET {}: {}", url, e)))?;
        if let Some(len) = content_length {
            if len != bytes.len() as u64 {
                return Err(ProxyError::Rpc(format!(
                    "bad HTTP body size read: {}, expected {}",
                    bytes.len(),
                    len
                )));
            }
        }
        info!("Read {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }

    pub async fn put(&self, key: &str, content: Vec<u8>, creds: AwsCredentials) -> Result<()> {
        let url = format!("{}{}", self.inner.base_url, key);
        debug!("PUT {}", url);

        let content_type = "application/octet-stream";
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        let mut canonical_headers = String::new();
        let mut request = self.inner.client.put(&url);

        // Keep the list of header values sorted!
        for (header, maybe_value) in [
            ("x-amz-security-token", creds.token()),
            ("x-amz-storage-class", Some("REDUCED_REDUNDANCY")),
        ] {
            if let Some(value) = maybe_value {
                request = request.header(header, value);
                canonical_headers.push_str(&format!("{}:{}\n", header.to_ascii_lowercase(), value));
            }
        }
        let auth = self.auth("PUT", &date, key, "", &canonical_headers, content_type, &creds);
        request = request
            .header("Date", &date)
            .header("Content-Type", content_type)
            .header("Content-Length", content.len())
            // Two weeks.
            .header("Cache-Control", "max-age=1296000")
            .header("Authorization", auth)
            .body(content);

        let res = request
            .send()
            .await
            .map_err(|e| ProxyError::Rpc(format!("PUT failed with error: {}", e)))?;
        if res.status().is_success() {
            trace!("PUT succeeded");
            Ok(())
        } else {
            trace!("PUT failed with HTTP status: {}", res.status());
            Err(ProxyError::Rpc(format!("bad HTTP status {} for PUT {}", res.status(), url)))
        }
    }

    // http://docs.aws.amazon.com/AmazonS3/latest/dev/RESTAuthentication.html
    fn auth(
        &self,
        verb: &str,
        date: &str,
        path: &str,
        md5: &str,
        headers: &str,
        content_type: &str,
        creds: &AwsCredentials,
    ) -> String {
        let string = format!(
            "{verb}\n{md5}\n{ty}\n{date}\n{headers}{resource}",
            verb = verb,
            md5 = md5,
            ty = content_type,
            date = date,
            headers = headers,
            resource = format!("/{}/{}", self.inner.name, path)
        );
        let signature = signature(&string, creds.aws_secret_access_key());
        format!("AWS {}:{}", creds.aws_access_key_id(), signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_respects_ssl_choice() {
        assert_eq!(base_url("s3.example.com", Ssl::Yes), "https://s3.example.com/");
        assert_eq!(base_url("s3.example.com", Ssl::No), "http://s3.example.com/");
    }

    #[test]
    fn signing_is_deterministic_for_identical_inputs() {
        let a = signature("string-to-sign", "secret");
        let b = signature("string-to-sign", "secret");
        assert_eq!(a, b);
        assert_ne!(a, signature("different-string", "secret"));
    }

    #[test]
    fn auth_header_has_expected_shape() {
        let bucket = Bucket::new("my-bucket", "s3.example.com", Ssl::Yes);
        let creds = AwsCredentials::new("AKIDEXAMPLE", "secret", None);
        let auth = bucket.auth("PUT", "Wed, 01 Jan 2020 00:00:00 GMT", "some/key", "", "", "application/octet-stream", &creds);
        assert!(auth.starts_with("AWS AKIDEXAMPLE:"));
    }
}
