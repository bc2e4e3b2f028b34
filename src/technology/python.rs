use super::{Technology, Workspace};

pub(super) const KEY: &str = "python";
pub(super) const DEFAULT_IMAGE: &str = "codecell/python";

const MAIN_FILE: &str = "main.py";

/// CPython script, run unbuffered so output streams line by line.
#[derive(Debug, Clone)]
pub(crate) struct PythonTechnology {
    image: String,
}

impl PythonTechnology {
    pub fn new(image: String) -> Self {
        Self { image }
    }
}

impl Technology for PythonTechnology {
    fn key(&self) -> &str {
        KEY
    }

    fn image(&self) -> &str {
        &self.image
    }

    fn command(&self) -> Vec<String> {
        vec!["python3".to_string(), "-u".to_string(), MAIN_FILE.to_string()]
    }

    fn materialize(&self, workspace: &mut Workspace, source_code: &str) {
        workspace.write(MAIN_FILE, source_code);
    }
}
