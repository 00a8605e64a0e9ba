// vbak is the operator tool of the vbak subvolume backup agent.
// Copyright (C) 2026  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod error;
use error::*;

use vbak_common::config::{AgentConfig, SubvolumeConfig};
use vbak_common::control::{self, ArchiveListing, Request, Response};
use vbak_common::lineage::{Run, RunOutcome};
use vbak_common::snapshot::TIMESTAMP_FMT;
use vbak_common::system;

use std::path::PathBuf;
use std::process;

use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Talk to this control socket instead of the default.
    #[arg(short, long)]
    socket: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Perform basic initialization of the agent.
    Init {
        /// The identifier of this client on the archival host.
        client_id: String,
        /// The host name or address of the archival host.
        remote_host: String,
        /// The user to authenticate as on the archival host.
        remote_user: String,
        /// The directory on the archival host all archives live below.
        remote_base_path: String,
        /// The directory local snapshots are created in.
        snapshot_dir: PathBuf,
        /// A subvolume to back up as a name=path pair. May be repeated.
        #[arg(long = "subvol")]
        subvols: Vec<String>,
    },
    /// Start a run.
    Run {
        /// Force full transfers for every subvolume.
        #[arg(short, long)]
        full: bool,
        /// The subvolumes to limit the run to.
        subvols: Vec<String>,
    },
    /// Cancel the active run.
    Cancel,
    /// Show the active or most recent run.
    Status,
    /// Page through the run history.
    Runs {
        /// How many runs to show.
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// How many runs to skip.
        #[arg(long, default_value_t = 0)]
        offset: u32,
        /// Limit the listing to one outcome.
        #[arg(long)]
        status: Option<String>,
    },
    /// List archive months or the archives of one month.
    Archives {
        /// The month bucket (YYYYMM) to list.
        month: Option<String>,
    },
    /// Run the retention reaper outside a run.
    Prune,
    /// Restore a subvolume into a target directory.
    Restore {
        /// The snapshot timestamp (YYYYMMDD-HHMMSS) to restore to.
        /// The latest archive is restored if omitted.
        #[arg(long)]
        at: Option<String>,
        /// The subvolume to restore.
        subvol: String,
        /// The directory to receive the subvolume into.
        target: PathBuf,
    },
}

fn logic() -> Result<()> {
    let cli = Cli::parse();

    let socket = cli
        .socket
        .unwrap_or_else(|| PathBuf::from(control::SOCKET_PATH));

    match cli.command {
        Commands::Init {
            client_id,
            remote_host,
            remote_user,
            remote_base_path,
            snapshot_dir,
            subvols,
        } => {
            let subvolumes = subvols
                .iter()
                .map(|spec| {
                    let (name, source_path) = spec
                        .split_once('=')
                        .ok_or_else(|| Error::BadSubvolumeSpec(spec.clone()))?;

                    Ok(SubvolumeConfig {
                        name: name.to_string(),
                        source_path: PathBuf::from(source_path),
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let config = AgentConfig::new(
                client_id,
                subvolumes,
                remote_host,
                remote_user,
                remote_base_path,
                snapshot_dir,
            );
            system::init(&config)?;

            println!("Initialized. Review {} before the first run.", AgentConfig::PATH);
        }
        Commands::Run { full, subvols } => {
            let request = Request::StartBackup {
                mode: None,
                force_full: full,
                subvolumes: subvols,
            };

            match control::request(&socket, &request)? {
                Response::Started(descriptor) => {
                    println!("Run {} started ({})", descriptor.run_id, descriptor.mode)
                }
                other => return Err(unexpected(other)),
            }
        }
        Commands::Cancel => match control::request(&socket, &Request::CancelBackup)? {
            Response::Cancelled => println!("Cancellation requested"),
            other => return Err(unexpected(other)),
        },
        Commands::Status => match control::request(&socket, &Request::BackupStatus)? {
            Response::Status(None) => println!("No runs yet"),
            Response::Status(Some(report)) => {
                println!(
                    "Run {} ({}): {}",
                    report.descriptor.run_id, report.descriptor.mode, report.descriptor.outcome
                );

                if let Some(progress) = report.progress {
                    println!(
                        "  {} [{}]: {} B read, {} B sent, {} s elapsed",
                        progress.subvol,
                        progress.stage,
                        progress.bytes_in,
                        progress.bytes_out,
                        progress.since_start.as_secs()
                    );
                }
            }
            other => return Err(unexpected(other)),
        },
        Commands::Runs {
            limit,
            offset,
            status,
        } => {
            let status = status
                .map(|value| {
                    RunOutcome::from_str(&value).ok_or(Error::UnknownOutcome(value))
                })
                .transpose()?;

            match control::request(&socket, &Request::ListRuns { limit, offset, status })? {
                Response::Runs(runs) => {
                    for run in runs {
                        print_run(&run);
                    }
                }
                other => return Err(unexpected(other)),
            }
        }
        Commands::Archives { month } => {
            match control::request(&socket, &Request::BrowseArchives { month })? {
                Response::Archives(ArchiveListing::Months(months)) => {
                    for month in months {
                        println!("{}", month);
                    }
                }
                Response::Archives(ArchiveListing::Entries(entries)) => {
                    for entry in entries {
                        println!(
                            "{}  {}  {} B  {}",
                            entry.id(),
                            entry.kind,
                            entry.bytes_written,
                            entry.remote_path
                        );
                    }
                }
                other => return Err(unexpected(other)),
            }
        }
        Commands::Prune => match control::request(&socket, &Request::Prune)? {
            Response::Pruned => println!("Retention pass complete"),
            other => return Err(unexpected(other)),
        },
        Commands::Restore { at, subvol, target } => {
            let at = at
                .map(|value| NaiveDateTime::parse_from_str(&value, TIMESTAMP_FMT))
                .transpose()?;

            let request = Request::StartRestore { subvol, at, target };
            match control::request(&socket, &request)? {
                Response::Restored(descriptor) => {
                    println!(
                        "Restored {} into {} ({} archives, {} B fetched)",
                        descriptor.subvol,
                        descriptor.target.display(),
                        descriptor.chain.len(),
                        descriptor.bytes_fetched
                    );
                }
                other => return Err(unexpected(other)),
            }
        }
    }

    Ok(())
}

fn print_run(run: &Run) {
    println!(
        "Run {} ({}): {} started {}{}",
        run.id,
        run.mode,
        run.outcome,
        run.started_at,
        run.error
            .as_deref()
            .map(|error| format!(", error: {}", error))
            .unwrap_or_default()
    );

    for item in &run.items {
        println!(
            "  {}: {}{}",
            item.subvol,
            item.outcome,
            item.error
                .as_deref()
                .map(|error| format!(" ({})", error))
                .unwrap_or_default()
        );
    }
}

fn unexpected(response: Response) -> Error {
    match response {
        Response::Error(message) => Error::Rejected(message),
        _ => Error::UnexpectedResponse,
    }
}

fn main() {
    match logic() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}
