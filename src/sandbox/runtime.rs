use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A supported interpreter runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Nodejs,
    Shell,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::Nodejs, Language::Shell];

    /// Parse a runtime identifier, accepting the usual aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Some(Self::Python),
            "nodejs" | "node" | "javascript" | "js" => Some(Self::Nodejs),
            "shell" | "sh" | "bash" => Some(Self::Shell),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Nodejs => "nodejs",
            Self::Shell => "shell",
        }
    }

    /// Name of the only file placed in the sandbox root.
    pub fn source_file(&self) -> &'static str {
        match self {
            Self::Python => "main.py",
            Self::Nodejs => "main.js",
            Self::Shell => "main.sh",
        }
    }

    /// Interpreter names, most preferred first.
    pub fn interpreters(&self) -> &'static [&'static str] {
        match self {
            Self::Python => &["python3", "python"],
            Self::Nodejs => &["node", "nodejs"],
            Self::Shell => &["sh", "bash"],
        }
    }

    /// Arguments placed before the source file.
    pub fn interpreter_args(&self) -> &'static [&'static str] {
        match self {
            // Unbuffered, so output streams as it is produced.
            Self::Python => &["-u"],
            Self::Nodejs | Self::Shell => &[],
        }
    }

    pub fn env(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Python => &[("PYTHONUNBUFFERED", "1"), ("PYTHONDONTWRITEBYTECODE", "1")],
            Self::Nodejs => &[("NODE_DISABLE_COLORS", "1")],
            Self::Shell => &[],
        }
    }

    pub fn default_image(&self) -> &'static str {
        match self {
            Self::Python => "python:3.12-slim",
            Self::Nodejs => "node:22-slim",
            Self::Shell => "alpine:latest",
        }
    }

    /// Locate the interpreter on the host.
    ///
    /// Falls back to the bare preferred name when nothing is found; spawning it
    /// then fails and the execution ends as a launch failure.
    pub fn resolve_interpreter(&self) -> PathBuf {
        self.interpreters()
            .iter()
            .find_map(|name| which::which(name).ok())
            .unwrap_or_else(|| PathBuf::from(self.interpreters()[0]))
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}
