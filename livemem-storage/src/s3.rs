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

//! S3-compatible backend over the raw REST protocol.
//!
//! Path-style addressing only. Signature dispatch is split per operation
//! class: PUT/GET/DELETE/COPY sign with the legacy V2 scheme, HEAD and LIST
//! with V4 — some object-store deployments reject the other combination
//! with signature-mismatch errors. Callers see one façade either way.
//!
//! Transient failures (connection errors, 5xx) are retried with
//! exponential backoff; listings paginate internally until the store
//! reports the final page.

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Method;
use std::time::Duration;
use url::Url;

use crate::sign::{http_date, uri_encode, V2Signer, V4Signer};
use crate::{ObjectInfo, ObjectStoreBackend, StorageError, StorageResult};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 200;
const PAGE_SIZE: u32 = 1000;

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Base endpoint, e.g. `https://s3.example.com`.
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

pub struct S3Backend {
    endpoint: String,
    bucket: String,
    host: String,
    http: reqwest::Client,
    v2: V2Signer,
    v4: V4Signer,
}

impl S3Backend {
    pub fn new(cfg: S3Config) -> StorageResult<Self> {
        let parsed = Url::parse(&cfg.endpoint)
            .map_err(|e| StorageError::Config(format!("invalid endpoint '{}': {e}", cfg.endpoint)))?;
        let host = match (parsed.host_str(), parsed.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(StorageError::Config(format!(
                    "endpoint '{}' has no host",
                    cfg.endpoint
                )))
            }
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            bucket: cfg.bucket.clone(),
            host,
            http,
            v2: V2Signer {
                access_key: cfg.access_key.clone(),
                secret_key: cfg.secret_key.clone(),
            },
            v4: V4Signer {
                access_key: cfg.access_key,
                secret_key: cfg.secret_key,
                region: cfg.region,
            },
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            self.bucket,
            uri_encode(key, false)
        )
    }

    fn bucket_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.bucket)
    }

    /// Data-plane request, legacy signing. The request is rebuilt (and
    /// re-dated) on every retry.
    async fn send_v2(
        &self,
        method: Method,
        key: &str,
        body: Option<&[u8]>,
        content_type: &str,
        amz_headers: &[(String, String)],
    ) -> StorageResult<reqwest::Response> {
        let url = self.object_url(key);
        let resource = format!("/{}/{}", self.bucket, key);

        let mut last_err = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            let date = http_date(chrono::Utc::now());
            let authorization =
                self.v2
                    .authorization(method.as_str(), content_type, &date, amz_headers, &resource);

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("Date", &date)
                .header("Authorization", &authorization);
            for (name, value) in amz_headers {
                request = request.header(name, value);
            }
            if let Some(bytes) = body {
                request = request
                    .header("Content-Type", content_type)
                    .body(bytes.to_vec());
            }

            match request.send().await {
                Ok(response) if response.status().is_server_error() => {
                    last_err = format!("status {}", response.status());
                }
                Ok(response) => return Ok(response),
                Err(e) => last_err = e.to_string(),
            }

            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(BACKOFF_BASE_MS << attempt)).await;
            }
        }
        Err(StorageError::Transport(format!(
            "{method} {key}: {last_err} after {MAX_ATTEMPTS} attempts"
        )))
    }

    /// Metadata-plane request, V4 signing with unsigned payload.
    async fn send_v4(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(String, String)],
    ) -> StorageResult<reqwest::Response> {
        let (url_base, canonical_uri) = match key {
            Some(k) => (
                self.object_url(k),
                format!("/{}/{}", self.bucket, uri_encode(k, false)),
            ),
            None => (self.bucket_url(), format!("/{}", self.bucket)),
        };
        let url = if query.is_empty() {
            url_base
        } else {
            format!(
                "{url_base}?{}",
                crate::sign::canonical_query_string(query)
            )
        };

        let mut last_err = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            let headers = self.v4.sign(
                method.as_str(),
                &self.host,
                &canonical_uri,
                query,
                chrono::Utc::now(),
            );

            let mut request = self.http.request(method.clone(), &url);
            for (name, value) in &headers {
                request = request.header(*name, value);
            }

            match request.send().await {
                Ok(response) if response.status().is_server_error() => {
                    last_err = format!("status {}", response.status());
                }
                Ok(response) => return Ok(response),
                Err(e) => last_err = e.to_string(),
            }

            if attempt + 1 < MAX_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(BACKOFF_BASE_MS << attempt)).await;
            }
        }
        Err(StorageError::Transport(format!(
            "{method} {}: {last_err} after {MAX_ATTEMPTS} attempts",
            key.unwrap_or("<bucket>")
        )))
    }

    async fn unexpected(key: &str, response: reqwest::Response) -> StorageError {
        let status = response.status().as_u16();
        let message = response
            .text()
            .await
            .unwrap_or_default()
            .chars()
            .take(300)
            .collect();
        StorageError::Unexpected {
            status,
            key: key.to_string(),
            message,
        }
    }
}

#[async_trait]
impl ObjectStoreBackend for S3Backend {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let response = self.send_v2(Method::GET, key, None, "", &[]).await?;
        match response.status().as_u16() {
            200 => Ok(Some(
                response
                    .bytes()
                    .await
                    .map_err(|e| StorageError::Transport(e.to_string()))?
                    .to_vec(),
            )),
            404 => Ok(None),
            _ => Err(Self::unexpected(key, response).await),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> StorageResult<()> {
        let response = self
            .send_v2(Method::PUT, key, Some(&body), content_type, &[])
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::unexpected(key, response).await)
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let response = self.send_v2(Method::DELETE, key, None, "", &[]).await?;
        // Deleting an absent key is a success for the caller.
        if response.status().is_success() || response.status().as_u16() == 404 {
            Ok(())
        } else {
            Err(Self::unexpected(key, response).await)
        }
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()> {
        let source = format!("/{}/{}", self.bucket, source_key);
        let amz = [("x-amz-copy-source".to_string(), source)];
        let response = self
            .send_v2(Method::PUT, dest_key, None, "", &amz)
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::unexpected(dest_key, response).await)
        }
    }

    async fn head(&self, key: &str) -> StorageResult<bool> {
        let response = self.send_v4(Method::HEAD, Some(key), &[]).await?;
        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(Self::unexpected(key, response).await),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
                ("max-keys".to_string(), PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self.send_v4(Method::GET, None, &query).await?;
            if !response.status().is_success() {
                return Err(Self::unexpected(prefix, response).await);
            }
            let xml = response
                .text()
                .await
                .map_err(|e| StorageError::Transport(e.to_string()))?;
            let page = parse_list_page(&xml)?;
            objects.extend(page.objects);

            if page.truncated {
                continuation = page.continuation;
                if continuation.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(objects)
    }

    async fn list_prefixes(&self, prefix: &str, delimiter: &str) -> StorageResult<Vec<String>> {
        let mut prefixes = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
                ("delimiter".to_string(), delimiter.to_string()),
                ("max-keys".to_string(), PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &continuation {
                query.push(("continuation-token".to_string(), token.clone()));
            }

            let response = self.send_v4(Method::GET, None, &query).await?;
            if !response.status().is_success() {
                return Err(Self::unexpected(prefix, response).await);
            }
            let xml = response
                .text()
                .await
                .map_err(|e| StorageError::Transport(e.to_string()))?;
            let page = parse_list_page(&xml)?;
            prefixes.extend(page.prefixes);

            if page.truncated {
                continuation = page.continuation;
                if continuation.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(prefixes)
    }

    async fn probe(&self) -> StorageResult<()> {
        let response = self.send_v4(Method::HEAD, None, &[]).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::unexpected("<bucket>", response).await)
        }
    }
}

struct ListPage {
    objects: Vec<ObjectInfo>,
    prefixes: Vec<String>,
    truncated: bool,
    continuation: Option<String>,
}

/// Decode one `ListBucketResult` page.
fn parse_list_page(xml: &str) -> StorageResult<ListPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage {
        objects: Vec::new(),
        prefixes: Vec::new(),
        truncated: false,
        continuation: None,
    };

    let mut in_contents = false;
    let mut in_common_prefixes = false;
    let mut element = String::new();
    let mut key = String::new();
    let mut size = 0u64;
    let mut modified = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                match name.as_str() {
                    "Contents" => {
                        in_contents = true;
                        key.clear();
                        size = 0;
                        modified.clear();
                    }
                    "CommonPrefixes" => in_common_prefixes = true,
                    _ => element = name,
                }
            }
            Ok(Event::Text(text)) => {
                let value = text
                    .unescape()
                    .map_err(|e| StorageError::Transport(format!("bad list XML: {e}")))?
                    .into_owned();
                match (in_contents, in_common_prefixes, element.as_str()) {
                    (true, _, "Key") => key = value,
                    (true, _, "Size") => size = value.parse().unwrap_or(0),
                    (true, _, "LastModified") => modified = value,
                    (false, true, "Prefix") => page.prefixes.push(value),
                    (false, false, "IsTruncated") => page.truncated = value == "true",
                    (false, false, "NextContinuationToken") => page.continuation = Some(value),
                    _ => {}
                }
            }
            Ok(Event::End(end)) => match end.name().as_ref() {
                b"Contents" => {
                    in_contents = false;
                    if !key.is_empty() {
                        page.objects.push(ObjectInfo {
                            key: std::mem::take(&mut key),
                            size,
                            modified: std::mem::take(&mut modified),
                        });
                    }
                }
                b"CommonPrefixes" => in_common_prefixes = false,
                _ => element.clear(),
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(StorageError::Transport(format!("bad list XML: {e}"))),
            _ => {}
        }
    }

    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult>
  <Name>live-mem</Name>
  <Prefix>demo/</Prefix>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>tok123</NextContinuationToken>
  <Contents>
    <Key>demo/_meta.json</Key>
    <LastModified>2026-02-20T18:00:00.000Z</LastModified>
    <Size>214</Size>
  </Contents>
  <Contents>
    <Key>demo/live/20260220T180000_cline_todo_a1b2c3d4.md</Key>
    <LastModified>2026-02-20T18:00:01.000Z</LastModified>
    <Size>98</Size>
  </Contents>
  <CommonPrefixes>
    <Prefix>demo/live/</Prefix>
  </CommonPrefixes>
</ListBucketResult>"#;

    #[test]
    fn parses_objects_prefixes_and_pagination() {
        let page = parse_list_page(SAMPLE).unwrap();
        assert_eq!(page.objects.len(), 2);
        assert_eq!(page.objects[0].key, "demo/_meta.json");
        assert_eq!(page.objects[0].size, 214);
        assert_eq!(page.prefixes, vec!["demo/live/"]);
        assert!(page.truncated);
        assert_eq!(page.continuation.as_deref(), Some("tok123"));
    }

    #[test]
    fn parses_empty_result() {
        let xml = r#"<?xml version="1.0"?><ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>"#;
        let page = parse_list_page(xml).unwrap();
        assert!(page.objects.is_empty());
        assert!(page.prefixes.is_empty());
        assert!(!page.truncated);
    }

    #[test]
    fn backend_rejects_bad_endpoint() {
        let cfg = S3Config {
            endpoint: "not a url".into(),
            access_key: "k".into(),
            secret_key: "s".into(),
            bucket: "b".into(),
            region: "r".into(),
        };
        assert!(S3Backend::new(cfg).is_err());
    }

    #[test]
    fn object_urls_are_path_style() {
        let backend = S3Backend::new(S3Config {
            endpoint: "https://s3.example.com".into(),
            access_key: "k".into(),
            secret_key: "s".into(),
            bucket: "live-mem".into(),
            region: "fr1".into(),
        })
        .unwrap();
        assert_eq!(
            backend.object_url("demo/_meta.json"),
            "https://s3.example.com/live-mem/demo/_meta.json"
        );
        assert_eq!(backend.host, "s3.example.com");
    }
}
