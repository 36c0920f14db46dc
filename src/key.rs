//! 会话键与分片键解析。

use std::fmt;

use crate::config::{KEY_DELIMITER, MAX_FILENAME_LEN, MAX_HASH_LEN};
use crate::error::UploadError;

/// Identifies one upload: the target filename plus the client-computed hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    filename: String,
    file_hash: String,
}

impl SessionKey {
    /// 校验文件名与哈希后构造会话键。
    pub fn new(filename: &str, file_hash: &str) -> Result<Self, UploadError> {
        validate_filename(filename)?;
        validate_hash(file_hash)?;
        // 会话目录名 `<filename>-<fileHash>` 同样受单个路径分量长度限制
        if filename.len() + KEY_DELIMITER.len_utf8() + file_hash.len() > MAX_FILENAME_LEN {
            return Err(UploadError::MalformedKey(format!(
                "filename and fileHash together exceed {MAX_FILENAME_LEN} bytes"
            )));
        }
        Ok(Self {
            filename: filename.to_string(),
            file_hash: file_hash.to_string(),
        })
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn file_hash(&self) -> &str {
        &self.file_hash
    }

    /// Directory name of the session under the chunk root.
    pub fn dir_name(&self) -> String {
        format!("{}{KEY_DELIMITER}{}", self.filename, self.file_hash)
    }

    /// File name of one chunk inside the session directory.
    pub fn chunk_file_name(&self, index: u64) -> String {
        format!("{}{KEY_DELIMITER}{index}", self.file_hash)
    }

    /// 从会话目录名还原会话键，无法识别时返回 None。
    pub fn from_dir_name(name: &str) -> Option<Self> {
        let (filename, file_hash) = name.rsplit_once(KEY_DELIMITER)?;
        Self::new(filename, file_hash).ok()
    }

    /// 从分片文件名解析下标，格式为 `<fileHash>-<index>`。
    pub fn parse_chunk_file_name(&self, name: &str) -> Option<u64> {
        let rest = name.strip_prefix(self.file_hash.as_str())?;
        let digits = rest.strip_prefix(KEY_DELIMITER)?;
        parse_index(digits)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir_name())
    }
}

/// A parsed `<filename>-<fileHash>-<index>` chunk key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkKey {
    pub session: SessionKey,
    pub index: u64,
}

/// 解析分片键。从右侧切分，因此文件名中允许出现分隔符。
pub fn parse_chunk_key(raw: &str) -> Result<ChunkKey, UploadError> {
    let mut fields = raw.rsplitn(3, KEY_DELIMITER);
    let (Some(index), Some(file_hash), Some(filename)) =
        (fields.next(), fields.next(), fields.next())
    else {
        return Err(UploadError::MalformedKey(format!(
            "expected <filename>{KEY_DELIMITER}<fileHash>{KEY_DELIMITER}<index>, got {raw:?}"
        )));
    };
    let index = parse_index(index).ok_or_else(|| {
        UploadError::MalformedKey(format!("index {index:?} is not a non-negative integer"))
    })?;
    let session = SessionKey::new(filename, file_hash)?;
    Ok(ChunkKey { session, index })
}

fn parse_index(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

fn validate_filename(filename: &str) -> Result<(), UploadError> {
    if filename.is_empty() {
        return Err(UploadError::MalformedKey("filename is required".into()));
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(UploadError::MalformedKey("filename is too long".into()));
    }
    if filename.starts_with('.') {
        return Err(UploadError::MalformedKey(
            "filename must not start with '.'".into(),
        ));
    }
    if filename.contains(['/', '\\', '\0']) {
        return Err(UploadError::MalformedKey(format!(
            "filename {filename:?} must be a single path component"
        )));
    }
    Ok(())
}

fn validate_hash(file_hash: &str) -> Result<(), UploadError> {
    if file_hash.is_empty() {
        return Err(UploadError::MalformedKey("fileHash is required".into()));
    }
    if file_hash.len() > MAX_HASH_LEN {
        return Err(UploadError::MalformedKey(format!(
            "fileHash is longer than {MAX_HASH_LEN} characters"
        )));
    }
    if !file_hash.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(UploadError::MalformedKey(format!(
            "fileHash {file_hash:?} must be alphanumeric"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_field_key() {
        let key = parse_chunk_key("video.mp4-9f86d081-12").expect("parse");
        assert_eq!(key.session.filename(), "video.mp4");
        assert_eq!(key.session.file_hash(), "9f86d081");
        assert_eq!(key.index, 12);
    }

    #[test]
    fn filename_may_contain_delimiter() {
        let key = parse_chunk_key("my-holiday-clip.mov-abc123-0").expect("parse");
        assert_eq!(key.session.filename(), "my-holiday-clip.mov");
        assert_eq!(key.session.file_hash(), "abc123");
        assert_eq!(key.index, 0);
    }

    #[test]
    fn rejects_key_without_index() {
        let result = parse_chunk_key("filename-hash");
        assert!(matches!(result, Err(UploadError::MalformedKey(_))));
    }

    #[test]
    fn rejects_non_numeric_or_signed_index() {
        for raw in ["a.bin-ff-x", "a.bin-ff-+1", "a.bin-ff-", "a.bin-ff-1.5"] {
            assert!(
                matches!(parse_chunk_key(raw), Err(UploadError::MalformedKey(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_unsafe_filenames() {
        for raw in ["../etc-ff-0", ".chunks-ff-0", "a/b-ff-0", "-ff-0"] {
            assert!(
                matches!(parse_chunk_key(raw), Err(UploadError::MalformedKey(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn overlong_names_are_malformed() {
        let long_hash = "f".repeat(300);
        let result = parse_chunk_key(&format!("a.bin-{long_hash}-0"));
        assert!(matches!(result, Err(UploadError::MalformedKey(_))));

        let hash = "f".repeat(MAX_HASH_LEN);
        assert!(SessionKey::new("a.bin", &hash).is_ok());

        let filename = "n".repeat(MAX_FILENAME_LEN - 8);
        assert!(matches!(
            SessionKey::new(&filename, "deadbeef"),
            Err(UploadError::MalformedKey(_))
        ));
        let fits = "n".repeat(MAX_FILENAME_LEN - 9);
        let key = SessionKey::new(&fits, "deadbeef").expect("key");
        assert_eq!(key.dir_name().len(), MAX_FILENAME_LEN);
    }

    #[test]
    fn dir_name_round_trips_with_dashed_filename() {
        let key = SessionKey::new("a-b.txt", "deadbeef").expect("key");
        assert_eq!(key.dir_name(), "a-b.txt-deadbeef");
        assert_eq!(SessionKey::from_dir_name(&key.dir_name()), Some(key));
    }

    #[test]
    fn chunk_file_names_parse_back_to_index() {
        let key = SessionKey::new("a.bin", "ff00").expect("key");
        assert_eq!(key.chunk_file_name(7), "ff00-7");
        assert_eq!(key.parse_chunk_file_name("ff00-7"), Some(7));
        assert_eq!(key.parse_chunk_file_name(".ff00-7.tmp.1234"), None);
        assert_eq!(key.parse_chunk_file_name("ee00-7"), None);
    }
}
