use std::fmt;
use std::path::Path;

use super::SetupError;

const OS_RELEASE: &str = "/etc/os-release";

/// Package family of the host operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Debian,
    Rhel,
}

impl OsFamily {
    /// Reads `/etc/os-release` once.
    pub async fn detect() -> Result<Self, SetupError> {
        Self::detect_from(Path::new(OS_RELEASE)).await
    }

    pub async fn detect_from(path: &Path) -> Result<Self, SetupError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_os_release(&content)
    }

    /// Matches `ID` and `ID_LIKE` against the known families.
    pub fn from_os_release(content: &str) -> Result<Self, SetupError> {
        let mut ids = Vec::new();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key == "ID" || key == "ID_LIKE" {
                let value = value.trim().trim_matches('"');
                ids.extend(value.split_whitespace().map(str::to_lowercase));
            }
        }

        for id in &ids {
            match id.as_str() {
                "debian" | "ubuntu" => return Ok(OsFamily::Debian),
                "rhel" | "centos" | "fedora" => return Ok(OsFamily::Rhel),
                _ => {}
            }
        }

        Err(SetupError::UnsupportedOs(ids.join(" ")))
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsFamily::Debian => write!(f, "debian"),
            OsFamily::Rhel => write!(f, "rhel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ubuntu() {
        let content = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"14.04\"\n";
        assert_eq!(OsFamily::from_os_release(content).unwrap(), OsFamily::Debian);
    }

    #[test]
    fn test_centos_via_id_like() {
        let content = "ID=\"centos\"\nID_LIKE=\"rhel fedora\"\n";
        assert_eq!(OsFamily::from_os_release(content).unwrap(), OsFamily::Rhel);
    }

    #[test]
    fn test_unknown_os() {
        let err = OsFamily::from_os_release("ID=alpine\n").unwrap_err();
        assert!(matches!(err, SetupError::UnsupportedOs(id) if id == "alpine"));
    }

    #[tokio::test]
    async fn test_detect_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("os-release");
        std::fs::write(&path, "ID=rhel\n").unwrap();

        assert_eq!(OsFamily::detect_from(&path).await.unwrap(), OsFamily::Rhel);
    }
}
