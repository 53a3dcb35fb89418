//! Remote platform detection and path conventions

use serde::Serialize;

use crate::ssh::ExecResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RemotePlatform {
    Windows,
    Linux,
    Darwin,
}

impl RemotePlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::Darwin => "darwin",
        }
    }

    /// Classify `uname -s` output.
    ///
    /// Only Windows shells write to stderr for this probe. Anything else that
    /// does not name a known kernel is unclassified.
    pub fn classify(result: &ExecResult) -> Option<Self> {
        if !result.stderr.is_empty() {
            return Some(Self::Windows);
        }
        let stdout = result.stdout.as_str();
        if stdout.contains("windows32") || stdout.contains("MINGW64") {
            Some(Self::Windows)
        } else if stdout.contains("Linux") {
            Some(Self::Linux)
        } else if stdout.contains("Darwin") {
            Some(Self::Darwin)
        } else {
            None
        }
    }

    pub fn separator(&self) -> &'static str {
        match self {
            Self::Windows => "\\",
            _ => "/",
        }
    }

    /// Join path segments with the platform separator
    pub fn join_path<S: AsRef<str>>(&self, segments: &[S]) -> String {
        segments
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(self.separator())
    }

    /// Name of the runtime executable
    pub fn node_executable(&self) -> &'static str {
        match self {
            Self::Windows => "node.exe",
            _ => "node",
        }
    }
}

impl std::fmt::Display for RemotePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_uname_output() {
        let darwin = ExecResult::new("Darwin\n", "");
        assert_eq!(RemotePlatform::classify(&darwin), Some(RemotePlatform::Darwin));
        let linux = ExecResult::new("Linux\n", "");
        assert_eq!(RemotePlatform::classify(&linux), Some(RemotePlatform::Linux));
        let mingw = ExecResult::new("MINGW64_NT-10.0-19045\n", "");
        assert_eq!(RemotePlatform::classify(&mingw), Some(RemotePlatform::Windows));
        let cmd = ExecResult::new("", "'uname' is not recognized");
        assert_eq!(RemotePlatform::classify(&cmd), Some(RemotePlatform::Windows));
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(RemotePlatform::classify(&ExecResult::default()), None);
        assert_eq!(RemotePlatform::classify(&ExecResult::new("FreeBSD\n", "")), None);
    }

    #[test]
    fn test_join_path() {
        assert_eq!(
            RemotePlatform::Linux.join_path(&["/home/u", ".app", "lib"]),
            "/home/u/.app/lib"
        );
        assert_eq!(
            RemotePlatform::Windows.join_path(&["C:\\Users\\u", ".app"]),
            "C:\\Users\\u\\.app"
        );
    }
}
