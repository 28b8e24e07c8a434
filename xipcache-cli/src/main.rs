// Copyright 2025 xipcache Project Authors
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

//! `xipcache-cli` drives a cache device over a directory-backed store for debugging.

mod run;

use clap::{Parser, Subcommand};
use run::RunArgs;
use xipcache::prelude::DeviceConfig;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a verified read/write workload through a cache device.
    Run(RunArgs),
    /// Print the default device configuration as json.
    Config,
}

fn init_logger() {
    use tracing_subscriber::{prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_line_number(true))
        .with(EnvFilter::from_default_env())
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logger();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run::run(args)?,
        Command::Config => println!("{}", serde_json::to_string_pretty(&DeviceConfig::default())?),
    }

    Ok(())
}
