// vbakd is the vbak daemon hosting the backup engine and its control socket.
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

use vbak_common::config::AgentConfig;
use vbak_common::control::{self, Request, Response};
use vbak_common::runner::RunController;

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{process, thread};

use clap::Parser;
use daemonizr::{Daemonizr, DaemonizrError, Stderr, Stdout};
use log::{info, warn};

const PWD: &str = "/";
const PIDFILE: &str = "/run/vbakd.pid";
const LOGFILE_STDOUT: &str = "/var/log/vbakd.out";
const LOGFILE_STDERR: &str = "/var/log/vbakd.err";

/// Poll interval of the accept loop while checking for termination.
const ACCEPT_TICK: Duration = Duration::from_millis(200);

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
/// Background process hosting the backup engine and its control socket.
struct Args {
    /// Stay attached to the terminal instead of daemonizing.
    #[arg(short, long)]
    debug: bool,
    /// Serve this control socket instead of the default.
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    if !args.debug {
        match Daemonizr::new()
            .work_dir(PathBuf::from(PWD))
            .expect("invalid workdir")
            .pidfile(PathBuf::from(PIDFILE))
            .stdout(Stdout::Redirect(PathBuf::from(LOGFILE_STDOUT)))
            .stderr(Stderr::Redirect(PathBuf::from(LOGFILE_STDERR)))
            .umask(0o027)
            .expect("invalid umask")
            .spawn()
        {
            Ok(_) => {}
            Err(DaemonizrError::AlreadyRunning) => {
                match Daemonizr::new()
                    .work_dir(PathBuf::from(PWD))
                    .unwrap()
                    .pidfile(PathBuf::from(PIDFILE))
                    .search()
                {
                    Ok(pid) => {
                        eprintln!("Another daemon with PID {} is already running", pid);
                        process::exit(1);
                    }
                    Err(e) => eprintln!("Daemonization PID search error: {}", e),
                }
            }
            Err(e) => {
                eprintln!("Daemonization error: {}", e);
                process::exit(1);
            }
        }
    }

    match serve(args) {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn serve(args: Args) -> Result<()> {
    let should_exit = Arc::new(AtomicBool::new(false));
    let should_exit2 = Arc::clone(&should_exit);

    ctrlc::set_handler(move || {
        eprintln!("[info] Caught SIGINT, SIGTERM or SIGHUP, exiting");
        should_exit2.store(true, Ordering::SeqCst);
    })?;

    let client_threads = Arc::new(Mutex::new(0));

    let config = AgentConfig::load()?;
    let controller = Arc::new(RunController::new(config)?);

    let socket_path = args
        .socket
        .unwrap_or_else(|| PathBuf::from(control::SOCKET_PATH));

    // A leftover socket from an unclean exit blocks the bind.
    let _ = fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path)?;
    fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600))?;
    listener.set_nonblocking(true)?;

    info!("<{}> Listening", socket_path.display());

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                *client_threads.lock().unwrap() += 1;

                let controller = Arc::clone(&controller);
                let client_threads = Arc::clone(&client_threads);
                thread::spawn(move || {
                    if let Err(e) = handle_client(&controller, stream) {
                        warn!("Cannot handle client: {}", e);
                    }

                    *client_threads.lock().unwrap() -= 1;
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if should_exit.load(Ordering::SeqCst) {
                    break;
                } else {
                    thread::sleep(ACCEPT_TICK);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    while *client_threads.lock().unwrap() > 0 {
        thread::sleep(ACCEPT_TICK);
    }

    // Tear down an active run cooperatively before exiting.
    controller.cancel();
    controller.wait();

    let _ = fs::remove_file(&socket_path);

    Ok(())
}

fn handle_client(controller: &Arc<RunController>, mut stream: UnixStream) -> Result<()> {
    let request = control::recv_message(&mut stream)?;
    let response = dispatch(controller, request);
    control::send_message(&mut stream, &response)?;

    Ok(())
}

fn dispatch(controller: &Arc<RunController>, request: Request) -> Response {
    match request {
        Request::StartBackup {
            mode,
            force_full,
            subvolumes,
        } => match controller.start(mode, force_full, &subvolumes) {
            Ok(descriptor) => Response::Started(descriptor),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::CancelBackup => {
            controller.cancel();
            Response::Cancelled
        }
        Request::BackupStatus => Response::Status(controller.status()),
        Request::ListRuns {
            limit,
            offset,
            status,
        } => match controller.list_runs(limit, offset, status) {
            Ok(runs) => Response::Runs(runs),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::BrowseArchives { month } => match controller.browse_archives(month) {
            Ok(listing) => Response::Archives(listing),
            Err(e) => Response::Error(e.to_string()),
        },
        Request::Prune => match controller.prune() {
            Ok(()) => Response::Pruned,
            Err(e) => Response::Error(e.to_string()),
        },
        Request::StartRestore { subvol, at, target } => {
            match controller.restore(&subvol, at, &target) {
                Ok(descriptor) => Response::Restored(descriptor),
                Err(e) => Response::Error(e.to_string()),
            }
        }
    }
}
