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

//! In-memory tar.gz building for exports and backup downloads.

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::ServiceError;

/// Build a gzip'd tar archive from `(relative_path, bytes)` entries.
pub fn build_targz(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>, ServiceError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, data.as_slice())
            .map_err(|e| ServiceError::Upstream(format!("archive build failed: {e}")))?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| ServiceError::Upstream(format!("archive build failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| ServiceError::Upstream(format!("archive build failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn archive_round_trips() {
        let entries = vec![
            ("_meta.json".to_string(), b"{}".to_vec()),
            ("live/a.md".to_string(), b"alpha".to_vec()),
        ];
        let bytes = build_targz(&entries).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(&bytes[..]));
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            seen.push((path, content));
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], ("live/a.md".to_string(), "alpha".to_string()));
    }
}
