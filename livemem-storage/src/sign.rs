// Copyright 2025 Livemem (https://github.com/livemem)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request signing for the S3 REST protocol.
//!
//! Two signature families, because some deployments accept only the legacy
//! scheme on data operations and only the modern scheme on metadata
//! operations:
//!
//! - V2: `Authorization: AWS {access}:{base64(hmac-sha1(secret, sts))}`
//!   over method, content headers, date, canonicalized amz headers and the
//!   path-style resource.
//! - V4: `AWS4-HMAC-SHA256` with an unsigned payload; only `host`,
//!   `x-amz-content-sha256` and `x-amz-date` are signed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Digest, Sha256};

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Legacy signer for the data plane (PUT/GET/DELETE/COPY).
#[derive(Debug, Clone)]
pub struct V2Signer {
    pub access_key: String,
    pub secret_key: String,
}

impl V2Signer {
    /// Build the `Authorization` header value.
    ///
    /// `resource` is the path-style canonicalized resource, e.g.
    /// `/bucket/space/live/note.md`. `amz_headers` are any `x-amz-*`
    /// headers that will be sent (the copy source, mainly).
    pub fn authorization(
        &self,
        method: &str,
        content_type: &str,
        date: &str,
        amz_headers: &[(String, String)],
        resource: &str,
    ) -> String {
        let mut sorted: Vec<(String, String)> = amz_headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        sorted.sort();

        let mut canonical_amz = String::new();
        for (name, value) in &sorted {
            canonical_amz.push_str(name);
            canonical_amz.push(':');
            canonical_amz.push_str(value);
            canonical_amz.push('\n');
        }

        let string_to_sign =
            format!("{method}\n\n{content_type}\n{date}\n{canonical_amz}{resource}");
        let signature = BASE64.encode(hmac_sha1(self.secret_key.as_bytes(), string_to_sign.as_bytes()));
        format!("AWS {}:{signature}", self.access_key)
    }
}

/// RFC 1123 date header used by the legacy scheme.
pub fn http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Modern signer for the metadata plane (HEAD/LIST).
#[derive(Debug, Clone)]
pub struct V4Signer {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

impl V4Signer {
    /// Produce the headers to attach: `x-amz-date`,
    /// `x-amz-content-sha256` and `authorization`.
    ///
    /// `canonical_uri` must already be URI-encoded (slashes kept); `query`
    /// is the raw parameter list, canonicalized here.
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        canonical_uri: &str,
        query: &[(String, String)],
        now: DateTime<Utc>,
    ) -> Vec<(&'static str, String)> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();

        let canonical_query = canonical_query_string(query);
        let canonical_headers = format!(
            "host:{host}\nx-amz-content-sha256:{UNSIGNED_PAYLOAD}\nx-amz-date:{amz_date}\n"
        );
        let canonical_request = format!(
            "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{SIGNED_HEADERS}\n{UNSIGNED_PAYLOAD}"
        );

        let scope = format!("{datestamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let mut key = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            datestamp.as_bytes(),
        );
        key = hmac_sha256(&key, self.region.as_bytes());
        key = hmac_sha256(&key, b"s3");
        key = hmac_sha256(&key, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            self.access_key
        );

        vec![
            ("x-amz-date", amz_date),
            ("x-amz-content-sha256", UNSIGNED_PAYLOAD.to_string()),
            ("authorization", authorization),
        ]
    }
}

/// Percent-encode per the V4 rules: unreserved characters pass through,
/// everything else becomes `%XX`; slashes survive only in URI paths.
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Sorted, fully-encoded query string.
pub fn canonical_query_string(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (uri_encode(k, true), uri_encode(v, true)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}
