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

use anyhow::Result;
use clap::Parser;
use livemem_server::{config::Settings, run_server};

#[derive(Parser, Debug)]
#[command(author, version, about = "Live Memory — shared working memory for AI agents", long_about = None)]
struct Args {
    /// Listen host (overrides environment)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides environment)
    #[arg(long)]
    port: Option<u16>,

    /// S3 bucket name (overrides environment)
    #[arg(long)]
    bucket: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::from_env();
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(bucket) = args.bucket {
        settings.storage.bucket = bucket;
    }

    run_server(settings).await
}
