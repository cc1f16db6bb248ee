// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HS256 signing key, loaded from `<statePath>/jwt.key` or generated and
//! persisted with owner-only permissions (§4.1 step 4).

use std::path::Path;

use rand::RngCore;

/// Signing key material backing every issued JWT.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

const KEY_BYTES: usize = 32;

impl SigningKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Load the key file, generating and persisting a fresh one if absent.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                if bytes.len() < KEY_BYTES {
                    anyhow::bail!("jwt key at {} is shorter than {KEY_BYTES} bytes", path.display());
                }
                Ok(Self(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut bytes = vec![0u8; KEY_BYTES];
                rand::rng().fill_bytes(&mut bytes);
                write_owner_only(path, &bytes)?;
                Ok(Self(bytes))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn write_owner_only(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new().write(true).create(true).truncate(true).mode(0o600).open(path)?;
    file.write_all(bytes)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_owner_only(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod keyfile_tests {
    use super::*;

    #[test]
    fn generates_and_reloads_same_key() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let path = dir.path().join("jwt.key");
        let first = SigningKey::load_or_generate(&path).unwrap_or_else(|e| panic!("generate: {e}"));
        let second = SigningKey::load_or_generate(&path).unwrap_or_else(|e| panic!("reload: {e}"));
        assert_eq!(first.as_bytes(), second.as_bytes());
        assert_eq!(first.as_bytes().len(), KEY_BYTES);
    }
}
