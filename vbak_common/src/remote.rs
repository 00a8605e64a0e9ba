// vbak_common is the main vbak library implementing the backup engine logic.
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

use crate::config::AgentConfig;
use crate::stream::MAGIC;
use crate::RemoteError;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use ssh2::{ErrorCode, RenameFlags, Session, Sftp};

/// Returns the temporary location a remote object is streamed to
/// before it is atomically renamed into place.
pub fn part_path(path: &str) -> String {
    format!("{}.part", path)
}

/// A `RemoteEntry` describes one object or directory
/// below the remote base path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteEntry {
    /// The file or directory name without its parent path.
    pub name: String,
    /// The size in bytes, zero for directories.
    pub size: u64,
    /// The modification time in seconds since the epoch, if known.
    pub mtime: Option<u64>,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// A `RemoteChannel` provides the file operations of the archival host.
///
/// One channel is used exclusively by a single run; retention reaping
/// and restores open their own channels. The capability set is narrow
/// by design so that tests can substitute an in-memory implementation.
pub trait RemoteChannel: Send {
    /// Creates the directory and all of its ancestors. Idempotent.
    fn ensure_dir(&self, path: &str) -> Result<(), RemoteError>;

    /// Reports whether an object exists at the path.
    fn exists(&self, path: &str) -> Result<bool, RemoteError>;

    /// Returns the size of the object at the path, or `None` if absent.
    fn size_of(&self, path: &str) -> Result<Option<u64>, RemoteError>;

    /// Opens a writer to the temporary `.part` location of the path,
    /// truncating any leftover from an earlier failed transfer.
    fn create_part(&self, path: &str) -> Result<Box<dyn Write + Send>, RemoteError>;

    /// Atomically renames the `.part` location to the final path.
    fn promote(&self, path: &str) -> Result<(), RemoteError>;

    /// Deletes the `.part` location of the path. Idempotent.
    fn discard_part(&self, path: &str) -> Result<(), RemoteError>;

    /// Opens the object at the path for reading.
    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>, RemoteError>;

    /// Atomically replaces the small object at the path with the
    /// provided contents (via the `.part` location).
    fn put_file(&self, path: &str, contents: &[u8]) -> Result<(), RemoteError>;

    /// Returns the entries of the directory at the path.
    /// An absent directory yields an empty listing.
    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError>;

    /// Deletes the object at the path. Idempotent.
    fn delete(&self, path: &str) -> Result<(), RemoteError>;

    /// Recursively deletes the directory at the path. Idempotent.
    fn delete_dir(&self, path: &str) -> Result<(), RemoteError>;

    /// Reads up to `n` bytes from the start of the object at the path.
    fn read_head(&self, path: &str, n: usize) -> Result<Vec<u8>, RemoteError>;

    /// Verifies that the object at the path has the expected size
    /// and starts with the archive format magic.
    fn verify_object(&self, path: &str, expected_size: u64) -> Result<bool, RemoteError> {
        match self.size_of(path)? {
            Some(size) if size == expected_size => {}
            _ => return Ok(false),
        }

        Ok(self.read_head(path, MAGIC.len())? == MAGIC)
    }
}

/// A `Connect` opens fresh [`RemoteChannel`]s to the archival host.
pub trait Connect: Send + Sync {
    fn connect(&self) -> Result<Box<dyn RemoteChannel>, RemoteError>;
}

/// Opens SSH sessions to the archival host configured in an [`AgentConfig`].
pub struct SshConnect {
    config: AgentConfig,
}

impl SshConnect {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

impl Connect for SshConnect {
    fn connect(&self) -> Result<Box<dyn RemoteChannel>, RemoteError> {
        Ok(Box::new(SshChannel::connect(&self.config)?))
    }
}

/// An `SshChannel` is a [`RemoteChannel`] backed by an authenticated
/// SSH session with the SFTP subsystem.
pub struct SshChannel {
    // Kept alive for the lifetime of the SFTP subsystem.
    _session: Session,
    sftp: Sftp,
}

impl SshChannel {
    /// Connects and authenticates to the archival host.
    ///
    /// Iterates over the resolved addresses until a connection succeeds
    /// or there are no more addresses left to try (dual stack hosts).
    pub fn connect(config: &AgentConfig) -> Result<Self, RemoteError> {
        let timeout = Duration::from_secs(config.connect_timeout_seconds);
        let addrs: Vec<SocketAddr> = (config.remote_host.as_str(), config.remote_port)
            .to_socket_addrs()?
            .collect();

        let stream = Self::connect_first_success(&addrs, timeout)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(stream);
        session.handshake()?;

        match &config.remote_key_file {
            Some(key_file) => {
                session.userauth_pubkey_file(&config.remote_user, None, key_file, None)?
            }
            None => session.userauth_agent(&config.remote_user)?,
        }

        let sftp = session.sftp()?;

        Ok(Self {
            _session: session,
            sftp,
        })
    }

    fn connect_first_success(
        addrs: &[SocketAddr],
        timeout: Duration,
    ) -> Result<TcpStream, RemoteError> {
        for (i, addr) in addrs.iter().enumerate() {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) if i == addrs.len() - 1 => return Err(e.into()),
                _ => {}
            }
        }

        Err(RemoteError::NoAddrs)
    }

    fn stat_opt(&self, path: &str) -> Result<Option<ssh2::FileStat>, RemoteError> {
        match self.sftp.stat(Path::new(path)) {
            Ok(stat) => Ok(Some(stat)),
            Err(e) if is_absent(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Reports whether an SFTP error means the path does not exist.
fn is_absent(e: &ssh2::Error) -> bool {
    // LIBSSH2_FX_NO_SUCH_FILE and LIBSSH2_FX_NO_SUCH_PATH.
    matches!(e.code(), ErrorCode::SFTP(2) | ErrorCode::SFTP(10))
}

impl RemoteChannel for SshChannel {
    fn ensure_dir(&self, path: &str) -> Result<(), RemoteError> {
        let mut prefix = String::new();

        for component in path.split('/').filter(|c| !c.is_empty()) {
            prefix.push('/');
            prefix.push_str(component);

            if self.stat_opt(&prefix)?.is_none() {
                if let Err(e) = self.sftp.mkdir(Path::new(&prefix), 0o755) {
                    // Lost a race against another creator is fine,
                    // anything else is not.
                    if self.stat_opt(&prefix)?.is_none() {
                        return Err(e.into());
                    }
                }
            }
        }

        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool, RemoteError> {
        Ok(self.stat_opt(path)?.is_some())
    }

    fn size_of(&self, path: &str) -> Result<Option<u64>, RemoteError> {
        Ok(self.stat_opt(path)?.and_then(|stat| stat.size))
    }

    fn create_part(&self, path: &str) -> Result<Box<dyn Write + Send>, RemoteError> {
        let file = self.sftp.create(Path::new(&part_path(path)))?;
        Ok(Box::new(file))
    }

    fn promote(&self, path: &str) -> Result<(), RemoteError> {
        self.sftp.rename(
            Path::new(&part_path(path)),
            Path::new(path),
            Some(RenameFlags::ATOMIC | RenameFlags::OVERWRITE),
        )?;

        Ok(())
    }

    fn discard_part(&self, path: &str) -> Result<(), RemoteError> {
        match self.sftp.unlink(Path::new(&part_path(path))) {
            Ok(()) => Ok(()),
            Err(e) if is_absent(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>, RemoteError> {
        match self.sftp.open(Path::new(path)) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if is_absent(&e) => Err(RemoteError::NoSuchObject(path.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn put_file(&self, path: &str, contents: &[u8]) -> Result<(), RemoteError> {
        let mut part = self.create_part(path)?;
        part.write_all(contents)?;
        part.flush()?;
        drop(part);

        self.promote(path)
    }

    fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let entries = match self.sftp.readdir(Path::new(path)) {
            Ok(entries) => entries,
            Err(e) if is_absent(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(entries
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_str()?.to_string();

                Some(RemoteEntry {
                    name,
                    size: stat.size.unwrap_or(0),
                    mtime: stat.mtime,
                    is_dir: stat.is_dir(),
                })
            })
            .collect())
    }

    fn delete(&self, path: &str) -> Result<(), RemoteError> {
        match self.sftp.unlink(Path::new(path)) {
            Ok(()) => Ok(()),
            Err(e) if is_absent(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_dir(&self, path: &str) -> Result<(), RemoteError> {
        for entry in self.list(path)? {
            let entry_path = format!("{}/{}", path, entry.name);

            if entry.is_dir {
                self.delete_dir(&entry_path)?;
            } else {
                self.delete(&entry_path)?;
            }
        }

        match self.sftp.rmdir(Path::new(path)) {
            Ok(()) => Ok(()),
            Err(e) if is_absent(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn read_head(&self, path: &str, n: usize) -> Result<Vec<u8>, RemoteError> {
        let mut file = self.open_read(path)?;

        let mut head = vec![0; n];
        let mut filled = 0;
        while filled < n {
            match file.read(&mut head[filled..])? {
                0 => break,
                read => filled += read,
            }
        }
        head.truncate(filled);

        Ok(head)
    }
}
