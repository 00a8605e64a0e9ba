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
use crate::SystemError;

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

/// File name of the archive encryption keyfile below the data directory.
pub const KEYFILE_NAME: &str = "backup-encryption.key";
/// File name of the lineage store below the data directory.
pub const LINEAGE_DB_NAME: &str = "lineage.db";

/// Size of the archive encryption key material in bytes.
pub const KEY_LEN: usize = 32;

/// Initializes the configuration file, data directory and keyfile.
pub fn init(config: &AgentConfig) -> Result<(), SystemError> {
    if Path::new(AgentConfig::PATH).exists() {
        return Err(SystemError::ConfigExists);
    }

    config.save()?;

    fs::create_dir_all(&config.data_dir)?;
    load_or_generate_keyfile(&keyfile_path(&config.data_dir))?;

    Ok(())
}

/// Returns the keyfile location below the provided data directory.
pub fn keyfile_path(data_dir: &Path) -> PathBuf {
    data_dir.join(KEYFILE_NAME)
}

/// Returns the lineage store location below the provided data directory.
pub fn lineage_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LINEAGE_DB_NAME)
}

/// Loads the archive encryption key material, generating and persisting
/// a fresh random keyfile (mode 0600) if none exists yet.
///
/// Losing the keyfile makes every archive unrecoverable,
/// so an existing file is never overwritten.
pub fn load_or_generate_keyfile(path: &Path) -> Result<Vec<u8>, SystemError> {
    match File::open(path) {
        Ok(mut f) => {
            if f.metadata()?.permissions().mode() & 0o7077 > 0 {
                return Err(SystemError::InsecurePerms(path.to_path_buf()));
            }

            let mut key = Vec::new();
            f.read_to_end(&mut key)?;

            if key.len() != KEY_LEN {
                return Err(SystemError::BadKeyfile(path.to_path_buf()));
            }

            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            let key = random_bytes(KEY_LEN);

            let mut f = OpenOptions::new()
                .create_new(true)
                .write(true)
                .mode(0o0600)
                .open(path)?;
            f.write_all(&key)?;
            f.sync_all()?;

            Ok(key)
        }
        Err(e) => Err(e.into()),
    }
}

/// Provides a `Vec<u8>` of `n` random bytes. Uses the thread-local generator
/// of the `rand` crate.
pub fn random_bytes(n: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Standard)
        .take(n)
        .collect()
}

/// Performs an HMAC-SHA256 hash computation.
pub fn hash_hmac(secret: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac: Hmac<Sha256> =
        Hmac::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(data);
    let hmac = mac.finalize();

    hmac.into_bytes().to_vec()
}

/// Derives the per-archive stream encryption key
/// from the keyfile material and the archive nonce.
///
/// The key material is high-entropy random data,
/// so a keyed hash is sufficient as the derivation function.
pub fn derive_stream_key(key_material: &[u8], nonce: &[u8]) -> Vec<u8> {
    hash_hmac(key_material, nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyfile_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = keyfile_path(dir.path());

        let key = load_or_generate_keyfile(&path).unwrap();
        assert_eq!(key.len(), KEY_LEN);

        let again = load_or_generate_keyfile(&path).unwrap();
        assert_eq!(key, again);
    }

    #[test]
    fn keyfile_rejects_insecure_perms() {
        let dir = tempfile::tempdir().unwrap();
        let path = keyfile_path(dir.path());

        load_or_generate_keyfile(&path).unwrap();

        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&path, perms).unwrap();

        assert!(matches!(
            load_or_generate_keyfile(&path),
            Err(SystemError::InsecurePerms(_))
        ));
    }

    #[test]
    fn derived_keys_depend_on_nonce() {
        let key = random_bytes(KEY_LEN);

        let a = derive_stream_key(&key, b"nonce-a");
        let b = derive_stream_key(&key, b"nonce-b");

        assert_ne!(a, b);
    }
}
