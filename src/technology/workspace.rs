//! In-memory project layout shipped into a sandbox as a tar archive.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::io;

/// File mode for every materialized file: readable by the runner, not executable.
const FILE_MODE: u32 = 0o644;

/// Files a technology wants present in the sandbox working directory.
#[derive(Debug, Default, Clone)]
pub(crate) struct Workspace {
    files: BTreeMap<String, Vec<u8>>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file, relative to the working directory.
    pub fn write(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }

    #[cfg(test)]
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Pack the workspace into an uncompressed tar archive.
    pub fn into_archive(self) -> io::Result<Bytes> {
        let mut tar_buf = Vec::new();
        {
            let mut tar = tar::Builder::new(&mut tar_buf);
            for (path, contents) in &self.files {
                let mut header = tar::Header::new_gnu();
                header.set_size(contents.len() as u64);
                header.set_mode(FILE_MODE);
                header.set_entry_type(tar::EntryType::Regular);
                tar.append_data(&mut header, path, contents.as_slice())?;
            }
            tar.finish()?;
        }
        Ok(Bytes::from(tar_buf))
    }
}
