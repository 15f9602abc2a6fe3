//! Domain identifiers (strongly-typed IDs).
//!
//! # Phantom Type パターン
//! `SessionId` は呼び出し側が決める論理 ID、`ResourceId` は Provisioner が払い出す ID。
//! どちらも中身は文字列だが、`Id<T>` の `T` をマーカー型にすることで
//! 取り違えをコンパイル時に防ぐ。
//!
//! # 文字種
//! ID はレジストリのキー（`agent:heartbeat:{session_id}`）とリソース名
//! （`session-{session_id}`）に埋め込まれるため、区切り文字 `:` と空白を含められない。

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// ID の最大長
pub const MAX_ID_LEN: usize = 128;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// エラーメッセージで使う種別名（例: "session"）
    fn kind() -> &'static str;
}

/// ID の検証エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("{kind} id must not be empty")]
    Empty { kind: &'static str },

    #[error("{kind} id is longer than {max} characters")]
    TooLong { kind: &'static str, max: usize },

    #[error("{kind} id contains invalid character {found:?}")]
    InvalidChar { kind: &'static str, found: char },
}

/// ジェネリック ID 型
///
/// ```ignore
/// let session = SessionId::new("chat-42")?;
/// let resource = ResourceId::new("3d8d9e1f")?;
/// // let _: SessionId = resource; // <- 型が違うのでコンパイルエラー
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<T: IdMarker> {
    value: String,
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// 文字列から ID を作成（検証あり）
    pub fn new(value: impl Into<String>) -> Result<Self, IdError> {
        let value = value.into();
        validate::<T>(&value)?;
        Ok(Self {
            value,
            _marker: PhantomData,
        })
    }

    /// ULID から ID を作成（小文字化した ULID は常に有効な ID）
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            value: ulid.to_string().to_lowercase(),
            _marker: PhantomData,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_string(self) -> String {
        self.value
    }
}

fn validate<T: IdMarker>(value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty { kind: T::kind() });
    }
    if value.chars().count() > MAX_ID_LEN {
        return Err(IdError::TooLong {
            kind: T::kind(),
            max: MAX_ID_LEN,
        });
    }
    if let Some(found) = value
        .chars()
        .find(|c| *c == ':' || c.is_whitespace() || c.is_control())
    {
        return Err(IdError::InvalidChar {
            kind: T::kind(),
            found,
        });
    }
    Ok(())
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<T: IdMarker> std::str::FromStr for Id<T> {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<T: IdMarker> Serialize for Id<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, T: IdMarker> Deserialize<'de> for Id<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Session のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Session {}

impl IdMarker for Session {
    fn kind() -> &'static str {
        "session"
    }
}

/// Resource のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resource {}

impl IdMarker for Resource {
    fn kind() -> &'static str {
        "resource"
    }
}

/// Identifier of a logical session (dedup unit).
pub type SessionId = Id<Session>;

/// Identifier of a provisioned compute resource.
pub type ResourceId = Id<Resource>;
