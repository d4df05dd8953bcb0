use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;

/// One row of a `/list` response, as stored in the metadata database.
///
/// `permissions` arrives as an octal string and `nlink` is absent on older
/// server versions; both are normalized through the accessor methods rather
/// than trusted inward as raw wire values.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteDirent {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub is_dir: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default = "default_permissions")]
    pub permissions: String,
    #[serde(default)]
    pub nlink: Option<u32>,
    #[serde(default)]
    pub version: i64,
}

fn default_permissions() -> String {
    "644".to_string()
}

impl RemoteDirent {
    pub fn is_dir(&self) -> bool {
        self.is_dir == 1
    }

    /// 9-bit mode word parsed from the octal permission string.
    pub fn mode(&self) -> u16 {
        u16::from_str_radix(&self.permissions, 8).unwrap_or(0o644) & 0o777
    }

    pub fn size(&self) -> u64 {
        if self.is_dir() {
            0
        } else {
            self.size.max(0) as u64
        }
    }

    /// Missing `nlink` defaults to 1 for files, 2 for directories.
    pub fn nlink(&self) -> u32 {
        self.nlink
            .unwrap_or_else(|| if self.is_dir() { 2 } else { 1 })
    }
}

/// Volume summary from `/stats`. The service serializes every field as a
/// decimal string.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeStats {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub bsize: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub blocks: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub bfree: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub bavail: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub files: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub ffree: u64,
}

impl VolumeStats {
    /// Static placeholder served when `/stats` is unreachable, so `df` keeps
    /// working against a degraded server.
    pub fn fallback() -> Self {
        Self {
            bsize: 4096,
            blocks: 1_000_000,
            bfree: 1_000_000,
            bavail: 1_000_000,
            files: 1_000_000,
            ffree: 1_000_000,
        }
    }
}

/// Response body of a `PUT /files` write.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteReply {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub written: u64,
}

/// An `fs_change` event from the push channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FsChangeEvent {
    pub op: String,
    #[serde(default, rename = "relPath")]
    pub rel_path: Option<String>,
    #[serde(default, rename = "oldPath")]
    pub old_path: Option<String>,
    #[serde(default, rename = "newPath")]
    pub new_path: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_dir: Option<bool>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mtime: Option<i64>,
    #[serde(default)]
    pub permissions: Option<String>,
}

impl FsChangeEvent {
    /// Fresh attributes carried on the event, if the server included them.
    pub fn metadata(&self) -> Option<(bool, u64, i64, u16)> {
        let is_dir = self.is_dir?;
        let size = self.size.unwrap_or(0);
        let mtime = self.mtime.unwrap_or(0);
        let mode = self
            .permissions
            .as_deref()
            .and_then(|p| u16::from_str_radix(p, 8).ok())
            .unwrap_or(0o644)
            & 0o777;
        Some((is_dir, size, mtime, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirent_parsing() {
        let json = r#"{
            "path": "./docs/readme.txt",
            "name": "readme.txt",
            "parent": "./docs",
            "is_dir": 0,
            "size": 1234,
            "mtime": 1700000000,
            "permissions": "640",
            "nlink": 1,
            "version": 3
        }"#;
        let de: RemoteDirent = serde_json::from_str(json).unwrap();
        assert!(!de.is_dir());
        assert_eq!(de.size(), 1234);
        assert_eq!(de.mode(), 0o640);
        assert_eq!(de.nlink(), 1);
    }

    #[test]
    fn test_dirent_missing_nlink_defaults() {
        let file: RemoteDirent =
            serde_json::from_str(r#"{"name": "f", "is_dir": 0, "size": 1, "mtime": 0}"#).unwrap();
        let dir: RemoteDirent =
            serde_json::from_str(r#"{"name": "d", "is_dir": 1, "size": 0, "mtime": 0}"#).unwrap();
        assert_eq!(file.nlink(), 1);
        assert_eq!(dir.nlink(), 2);
    }

    #[test]
    fn test_dirent_bad_permissions_fall_back() {
        let de: RemoteDirent =
            serde_json::from_str(r#"{"name": "f", "is_dir": 0, "permissions": "not-octal"}"#)
                .unwrap();
        assert_eq!(de.mode(), 0o644);
    }

    #[test]
    fn test_directory_size_is_zero() {
        let de: RemoteDirent =
            serde_json::from_str(r#"{"name": "d", "is_dir": 1, "size": 4096, "mtime": 0}"#)
                .unwrap();
        assert_eq!(de.size(), 0);
    }

    #[test]
    fn test_volume_stats_decimal_strings() {
        let json = r#"{
            "bsize": "4096",
            "blocks": "2621440",
            "bfree": "1310720",
            "bavail": "1310000",
            "files": "655360",
            "ffree": "600000"
        }"#;
        let stats: VolumeStats = serde_json::from_str(json).unwrap();
        assert_eq!(stats.bsize, 4096);
        assert_eq!(stats.blocks, 2_621_440);
        assert_eq!(stats.bavail, 1_310_000);
    }

    #[test]
    fn test_change_event_rename_payload() {
        let json = r#"{
            "op": "rename",
            "oldPath": "./a/x",
            "newPath": "./b/x",
            "name": "x",
            "is_dir": false,
            "size": 42,
            "mtime": 1700000000,
            "permissions": "644"
        }"#;
        let ev: FsChangeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(ev.op, "rename");
        assert_eq!(ev.old_path.as_deref(), Some("./a/x"));
        assert_eq!(ev.new_path.as_deref(), Some("./b/x"));
        let (is_dir, size, _, mode) = ev.metadata().unwrap();
        assert!(!is_dir);
        assert_eq!(size, 42);
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn test_change_event_without_metadata() {
        let ev: FsChangeEvent =
            serde_json::from_str(r#"{"op": "unlink", "relPath": "./gone"}"#).unwrap();
        assert!(ev.metadata().is_none());
    }
}
