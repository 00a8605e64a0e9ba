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

use crate::stream::CompressAlgo;
use crate::SystemError;

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A `SubvolumeConfig` names one subvolume selected for backup.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubvolumeConfig {
    /// The name of the subvolume, used in snapshot and archive names.
    pub name: String,
    /// The path of the live subvolume to snapshot.
    pub source_path: PathBuf,
}

/// An `AgentConfig` contains everything the agent needs to know
/// about the local machine and the archival host.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// The identifier of this client, the prefix of all of its archives
    /// below the remote base path.
    pub client_id: String,
    /// The subvolumes to back up, processed in this order on every run.
    pub subvolumes: Vec<SubvolumeConfig>,

    /// The host name or address of the archival host.
    pub remote_host: String,
    /// The user to authenticate as on the archival host.
    pub remote_user: String,
    /// The SSH port of the archival host.
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    /// The directory on the archival host all archives live below.
    pub remote_base_path: String,
    /// The private key file to authenticate with.
    /// The SSH agent is consulted if unset.
    #[serde(default)]
    pub remote_key_file: Option<PathBuf>,

    /// The directory local snapshots are created in.
    pub snapshot_dir: PathBuf,
    /// The private data directory holding the keyfile and the lineage store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// How many month buckets to keep on the archival host.
    #[serde(default = "default_months_to_keep")]
    pub months_to_keep: u32,
    /// The maximum incremental chain length and incremental retention in days.
    #[serde(default = "default_daily_incremental_days")]
    pub daily_incremental_days: u32,
    /// How many days to keep local snapshots.
    #[serde(default = "default_local_snapshot_days")]
    pub local_snapshot_days: u32,
    /// Force a full backup if the last full one is older than this many days.
    #[serde(default = "default_full_interval_days")]
    pub full_interval_days: u32,

    /// The streaming compression algorithm to apply before encryption.
    #[serde(default)]
    pub compress_algo: CompressAlgo,
    /// The compression level passed to the chosen algorithm.
    #[serde(default = "default_compress_level")]
    pub compress_level: i32,

    /// How many seconds to wait for the archival host to accept a connection.
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,

    /// Whether the external trigger should start runs automatically.
    /// Never evaluated by the engine itself.
    #[serde(default)]
    pub schedule_enabled: bool,
    /// The time of day the external trigger should start runs at.
    /// Never evaluated by the engine itself.
    #[serde(default)]
    pub schedule_time: Option<String>,
    /// The days of the week the external trigger should start runs on.
    /// Never evaluated by the engine itself.
    #[serde(default)]
    pub schedule_days: Vec<String>,
}

fn default_remote_port() -> u16 {
    22
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/vbak")
}

fn default_months_to_keep() -> u32 {
    6
}

fn default_daily_incremental_days() -> u32 {
    30
}

fn default_local_snapshot_days() -> u32 {
    7
}

fn default_full_interval_days() -> u32 {
    30
}

fn default_compress_level() -> i32 {
    3
}

fn default_connect_timeout_seconds() -> u64 {
    30
}

impl AgentConfig {
    pub const PATH: &'static str = "/etc/vbak.conf";

    /// Constructs a configuration with defaults for everything
    /// beyond the required connection and layout settings.
    pub fn new(
        client_id: String,
        subvolumes: Vec<SubvolumeConfig>,
        remote_host: String,
        remote_user: String,
        remote_base_path: String,
        snapshot_dir: PathBuf,
    ) -> Self {
        Self {
            client_id,
            subvolumes,
            remote_host,
            remote_user,
            remote_port: default_remote_port(),
            remote_base_path,
            remote_key_file: None,
            snapshot_dir,
            data_dir: default_data_dir(),
            months_to_keep: default_months_to_keep(),
            daily_incremental_days: default_daily_incremental_days(),
            local_snapshot_days: default_local_snapshot_days(),
            full_interval_days: default_full_interval_days(),
            compress_algo: CompressAlgo::default(),
            compress_level: default_compress_level(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            schedule_enabled: false,
            schedule_time: None,
            schedule_days: Vec::new(),
        }
    }

    /// Loads the configuration file of the current machine.
    pub fn load() -> Result<Self, SystemError> {
        Self::load_from(Self::PATH)
    }

    /// Loads a configuration file from an explicit location.
    pub fn load_from(path: &str) -> Result<Self, SystemError> {
        let mut f = File::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SystemError::ConfigUninit
            } else {
                e.into()
            }
        })?;

        if f.metadata()?.permissions().mode() & 0o7077 > 0 {
            return Err(SystemError::InsecurePerms(PathBuf::from(path)));
        }

        let mut s = String::new();
        f.read_to_string(&mut s)?;

        Ok(toml::from_str(&s)?)
    }

    /// Saves the configuration to the configuration file on the current machine.
    pub fn save(&self) -> Result<(), SystemError> {
        let s = toml::to_string_pretty(self)?;

        let mut f = OpenOptions::new()
            .create(true)
            .read(false)
            .write(true)
            .append(false)
            .truncate(true)
            .mode(0o0600)
            .open(Self::PATH)?;

        write!(f, "{}", s)?;
        Ok(())
    }

    /// Returns the configuration of the named subvolume, if present.
    pub fn subvolume(&self, name: &str) -> Option<&SubvolumeConfig> {
        self.subvolumes.iter().find(|subvol| subvol.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let config: AgentConfig = toml::from_str(
            r#"
            client_id = "talos"
            remote_host = "10.11.0.1"
            remote_user = "backup"
            remote_base_path = "/srv/backups"
            snapshot_dir = "/snapshots"

            [[subvolumes]]
            name = "root"
            source_path = "/"

            [[subvolumes]]
            name = "home"
            source_path = "/home"
            "#,
        )
        .unwrap();

        assert_eq!(config.remote_port, 22);
        assert_eq!(config.months_to_keep, 6);
        assert_eq!(config.daily_incremental_days, 30);
        assert_eq!(config.local_snapshot_days, 7);
        assert_eq!(config.compress_algo, CompressAlgo::Zstd);
        assert_eq!(config.connect_timeout_seconds, 30);
        assert!(!config.schedule_enabled);
        assert_eq!(config.subvolume("home").unwrap().source_path, PathBuf::from("/home"));
        assert!(config.subvolume("var").is_none());
    }
}
