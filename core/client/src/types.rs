//! Graph resource types and the metadata the client hands out.

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

/// A Graph `driveItem`, trimmed to the fields the client reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    /// Item ID.
    pub id: String,
    /// Item name.
    pub name: String,
    /// Size in bytes; for folders the sum of their contents.
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub e_tag: Option<String>,
    #[serde(default)]
    pub c_tag: Option<String>,
    /// Present for files.
    #[serde(default)]
    pub file: Option<FileFacet>,
    /// Present for folders.
    #[serde(default)]
    pub folder: Option<FolderFacet>,
    #[serde(default)]
    pub parent_reference: Option<ItemReference>,
}

impl DriveItem {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }

    /// Best content hash the service reported.
    pub fn content_hash(&self) -> Option<&str> {
        let hashes = self.file.as_ref()?.hashes.as_ref()?;
        hashes
            .quick_xor_hash
            .as_deref()
            .or(hashes.sha256_hash.as_deref())
            .or(hashes.sha1_hash.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub hashes: Option<Hashes>,
}

/// Hashes of a file's content. Personal drives report `sha1Hash` and
/// `quickXorHash`, business drives only `quickXorHash`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hashes {
    #[serde(default)]
    pub quick_xor_hash: Option<String>,
    #[serde(default)]
    pub sha1_hash: Option<String>,
    #[serde(default)]
    pub sha256_hash: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    #[serde(default)]
    pub child_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReference {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub drive_id: Option<String>,
    /// Path of the parent, e.g. `/drive/root:/Documents`.
    #[serde(default)]
    pub path: Option<String>,
}

/// A drive, as answered by `GET /me/drive`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveInfo {
    pub id: String,
    #[serde(default)]
    pub drive_type: Option<String>,
    #[serde(default)]
    pub quota: Option<Quota>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quota {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub used: Option<u64>,
    #[serde(default)]
    pub remaining: Option<u64>,
    /// `normal`, `nearing`, `critical` or `exceeded`.
    #[serde(default)]
    pub state: Option<String>,
}

/// One page of a Graph collection.
#[derive(Debug, Deserialize)]
pub(crate) struct GraphPage<T> {
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

/// Graph error envelope: `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, Deserialize)]
pub(crate) struct GraphErrorBody {
    pub error: GraphError,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Answer to `createUploadSession`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadSession {
    pub upload_url: String,
    #[serde(default)]
    pub expiration_date_time: Option<DateTime<Utc>>,
}

/// What the service does when the target name is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictBehavior {
    /// Fail with a conflict error.
    Fail,
    /// Overwrite the existing item.
    #[default]
    Replace,
    /// Pick a new, unused name.
    Rename,
}

impl ConflictBehavior {
    /// Value of `@microsoft.graph.conflictBehavior`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictBehavior::Fail => "fail",
            ConflictBehavior::Replace => "replace",
            ConflictBehavior::Rename => "rename",
        }
    }
}

/// Metadata for a remote item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Graph item ID.
    pub id: String,
    /// Name of the item.
    pub name: String,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Whether this is a folder.
    pub is_folder: bool,
    /// Last modification time, or creation time if Graph sent none.
    pub modified: Option<DateTime<Utc>>,
    /// Content hash (quickXor, SHA-256 or SHA-1, whichever is known first).
    pub hash: Option<String>,
    /// ETag for conflict detection.
    pub etag: Option<String>,
    pub mime_type: Option<String>,
    /// Number of children (folders only).
    pub child_count: Option<u64>,
    /// Drive path of the parent folder, e.g. `/Documents`.
    pub parent_path: Option<String>,
}

impl From<DriveItem> for Metadata {
    fn from(item: DriveItem) -> Self {
        let hash = item.content_hash().map(str::to_string);
        let is_folder = item.is_folder();
        let parent_path = item
            .parent_reference
            .as_ref()
            .and_then(|r| r.path.as_deref())
            .map(parent_drive_path);

        Self {
            id: item.id,
            name: item.name,
            size: item.size,
            is_folder,
            modified: item.last_modified_date_time.or(item.created_date_time),
            hash,
            etag: item.e_tag,
            mime_type: item.file.and_then(|f| f.mime_type),
            child_count: item.folder.and_then(|f| f.child_count),
            parent_path,
        }
    }
}

/// Strip the `/drive/root:` (or `/drives/{id}/root:`) prefix Graph puts
/// on parent paths and undo its percent-encoding.
fn parent_drive_path(raw: &str) -> String {
    let path = match raw.find("root:") {
        Some(idx) => &raw[idx + "root:".len()..],
        None => raw,
    };
    if path.is_empty() {
        "/".to_string()
    } else {
        percent_decode_str(path).decode_utf8_lossy().into_owned()
    }
}

/// Children of one folder, split by kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderListing {
    pub files: Vec<Metadata>,
    pub folders: Vec<Metadata>,
}

impl FolderListing {
    /// Find a file by name.
    pub fn file(&self, name: &str) -> Option<&Metadata> {
        self.files.iter().find(|m| m.name == name)
    }

    /// Find a folder by name.
    pub fn folder(&self, name: &str) -> Option<&Metadata> {
        self.folders.iter().find(|m| m.name == name)
    }

    /// Total number of children.
    pub fn len(&self) -> usize {
        self.files.len() + self.folders.len()
    }

    /// Check if the folder has no children.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<DriveItem> for FolderListing {
    fn from_iter<I: IntoIterator<Item = DriveItem>>(iter: I) -> Self {
        let mut listing = FolderListing::default();
        for item in iter {
            if item.is_folder() {
                listing.folders.push(item.into());
            } else {
                listing.files.push(item.into());
            }
        }
        listing
    }
}
